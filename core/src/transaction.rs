use std::time::Duration;

use crate::error::{DocumentError, ErrorClass};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
/// Largest value `statement_timeout` accepts (an int of milliseconds)
pub const MAX_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever the server is configured with (read committed on a stock install)
    #[default]
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub retryable_errors: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: 2.0,
            retryable_errors: vec![ErrorClass::SerializationFailure, ErrorClass::Deadlock],
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry
    pub fn none() -> Self { Self { max_retries: 0, ..Self::default() } }

    pub fn is_retryable(&self, err: &DocumentError) -> bool { self.retryable_errors.contains(&err.class()) }

    /// Delay before retry number `attempt` (zero based): the initial delay
    /// grown by the backoff factor, capped at the max delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }

    fn validated(mut self) -> Result<Self, DocumentError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(DocumentError::InvalidConfig(format!("backoff factor must be a finite number >= 1.0, got {}", self.backoff_factor)));
        }
        if self.initial_delay.is_zero() {
            self.initial_delay = DEFAULT_INITIAL_DELAY;
        }
        if self.max_delay < self.initial_delay {
            self.max_delay = self.initial_delay;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionConfig {
    pub timeout: Duration,
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
    pub retry_policy: RetryPolicy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_TIMEOUT, isolation_level: IsolationLevel::Default, read_only: false, retry_policy: RetryPolicy::default() }
    }
}

impl TransactionConfig {
    pub fn new() -> Self { Self::default() }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Fill unset values from the defaults and reject nonsensical ones.
    /// Timeouts under a millisecond round up to one; a zero statement
    /// timeout means none.
    pub fn validated(mut self) -> Result<Self, DocumentError> {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(DocumentError::InvalidConfig(format!("timeout must be at most {:?}, got {:?}", MAX_TIMEOUT, self.timeout)));
        }
        self.timeout = self.timeout.max(MIN_TIMEOUT);
        self.retry_policy = self.retry_policy.validated()?;
        Ok(self)
    }

    /// The `BEGIN` statement for this configuration
    pub fn begin_statement(&self) -> String {
        let mut statement = String::from("BEGIN");
        if let Some(level) = self.isolation_level.as_sql() {
            statement.push_str(" ISOLATION LEVEL ");
            statement.push_str(level);
        }
        statement.push_str(if self.read_only { " READ ONLY" } else { " READ WRITE" });
        statement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = TransactionConfig::new()
            .with_timeout(Duration::ZERO)
            .with_retry_policy(RetryPolicy { initial_delay: Duration::ZERO, max_delay: Duration::ZERO, ..RetryPolicy::default() })
            .validated()
            .unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retry_policy.initial_delay, DEFAULT_INITIAL_DELAY);
        assert_eq!(config.retry_policy.max_delay, DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn timeouts_fit_the_statement_timeout() {
        let config = TransactionConfig::new().with_timeout(Duration::from_micros(300)).validated().unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1));

        assert!(TransactionConfig::new().with_timeout(MAX_TIMEOUT).validated().is_ok());
        let too_long = TransactionConfig::new().with_timeout(Duration::from_secs(30 * 24 * 3600));
        assert!(matches!(too_long.validated(), Err(DocumentError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let config = TransactionConfig::new().with_retry_policy(RetryPolicy { backoff_factor: 0.5, ..RetryPolicy::default() });
        assert!(matches!(config.validated(), Err(DocumentError::InvalidConfig(_))));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_factor: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn begin_statement_reflects_mode() {
        assert_eq!(TransactionConfig::new().begin_statement(), "BEGIN READ WRITE");
        assert_eq!(
            TransactionConfig::new().with_isolation_level(IsolationLevel::Serializable).read_only(true).begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY"
        );
    }

    #[test]
    fn retryable_classes() {
        let policy = RetryPolicy::default();
        let conflict = DocumentError::Driver { operation: "commit", collection: String::new(), code: Some("40001".into()), message: "conflict".into(), source: "conflict".into() };
        assert!(policy.is_retryable(&conflict));
        assert!(!policy.is_retryable(&DocumentError::NoDocuments));
    }
}
