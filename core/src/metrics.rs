//! Transaction metrics.
//!
//! Counters are atomics so the hot path never takes a lock; the
//! per-transaction records sit behind a read-write lock and are handed out
//! as clones. One collector is shared by `Arc` between a store and all of
//! its transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::error::DocumentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, TransactionStatus::Active) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    pub transaction_id: Ulid,
    pub started_at: DateTime<Utc>,
    pub status: TransactionStatus,
    pub database_type: &'static str,
    pub operation_count: u64,
    /// Set at the terminal transition
    pub duration: Option<Duration>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalMetrics {
    pub active_transactions: u64,
    pub total_transactions: u64,
    pub committed_transactions: u64,
    pub rolled_back_transactions: u64,
    pub failed_transactions: u64,
    /// Mean duration of finished transactions
    pub average_duration: Duration,
    /// Committed over finished, 0.0 before anything finished
    pub success_rate: f64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    active: AtomicU64,
    total: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    total_duration_micros: AtomicU64,
    transactions: RwLock<HashMap<Ulid, TransactionMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self { Self::default() }

    pub fn start(&self, transaction_id: Ulid, database_type: &'static str) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        let record = TransactionMetrics {
            transaction_id,
            started_at: Utc::now(),
            status: TransactionStatus::Active,
            database_type,
            operation_count: 0,
            duration: None,
            completed_at: None,
            error_code: None,
            error_message: None,
        };
        self.transactions.write().unwrap_or_else(PoisonError::into_inner).insert(transaction_id, record);
    }

    pub fn record_operation(&self, transaction_id: Ulid) {
        if let Some(record) = self.transactions.write().unwrap_or_else(PoisonError::into_inner).get_mut(&transaction_id) {
            record.operation_count += 1;
        }
    }

    /// Move a transaction to a terminal status. Only the first terminal
    /// transition counts; returns false for any later one.
    pub fn finish(&self, transaction_id: Ulid, status: TransactionStatus, duration: Duration, error: Option<&DocumentError>) -> bool {
        if !status.is_terminal() {
            return false;
        }
        {
            let mut transactions = self.transactions.write().unwrap_or_else(PoisonError::into_inner);
            let Some(record) = transactions.get_mut(&transaction_id) else { return false };
            if record.status.is_terminal() {
                return false;
            }
            record.status = status;
            record.duration = Some(duration);
            record.completed_at = Some(Utc::now());
            if let Some(err) = error {
                record.error_code = err.code().map(str::to_owned);
                record.error_message = Some(err.to_string());
            }
        }

        self.active.fetch_sub(1, Ordering::Relaxed);
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_duration_micros.fetch_add(micros, Ordering::Relaxed);
        match status {
            TransactionStatus::Committed => self.committed.fetch_add(1, Ordering::Relaxed),
            TransactionStatus::RolledBack => self.rolled_back.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        true
    }

    pub fn transaction(&self, transaction_id: Ulid) -> Option<TransactionMetrics> {
        self.transactions.read().unwrap_or_else(PoisonError::into_inner).get(&transaction_id).cloned()
    }

    pub fn transactions(&self) -> Vec<TransactionMetrics> {
        self.transactions.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    pub fn global(&self) -> GlobalMetrics {
        let committed = self.committed.load(Ordering::Relaxed);
        let rolled_back = self.rolled_back.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = committed + rolled_back + failed;
        let (average_duration, success_rate) = if finished == 0 {
            (Duration::ZERO, 0.0)
        } else {
            let total = self.total_duration_micros.load(Ordering::Relaxed);
            (Duration::from_micros(total / finished), committed as f64 / finished as f64)
        };
        GlobalMetrics {
            active_transactions: self.active.load(Ordering::Relaxed),
            total_transactions: self.total.load(Ordering::Relaxed),
            committed_transactions: committed,
            rolled_back_transactions: rolled_back,
            failed_transactions: failed,
            average_duration,
            success_rate,
        }
    }

    /// Drop records of transactions that finished at least `older_than`
    /// ago. Active transactions are never removed. Returns how many were
    /// removed.
    pub fn cleanup_completed_transactions(&self, older_than: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(older_than) else { return 0 };
        let cutoff = Utc::now() - retention;
        let mut transactions = self.transactions.write().unwrap_or_else(PoisonError::into_inner);
        let before = transactions.len();
        transactions.retain(|_, record| match record.completed_at {
            Some(completed_at) if record.status.is_terminal() => completed_at > cutoff,
            _ => true,
        });
        before - transactions.len()
    }

    /// Run [`cleanup_completed_transactions`](Self::cleanup_completed_transactions)
    /// every `interval` until the handle is stopped or dropped, or the
    /// collector itself goes away.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, retention: Duration) -> CleanupHandle {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let collector: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let Some(collector) = collector.upgrade() else { break };
                        let removed = collector.cleanup_completed_transactions(retention);
                        if removed > 0 {
                            debug!("MetricsCollector.cleanup: removed {} completed transactions", removed);
                        }
                    }
                }
            }
        });
        CleanupHandle { stop: Some(stop) }
    }
}

/// Stops the periodic cleanup task when stopped or dropped.
#[derive(Debug)]
pub struct CleanupHandle {
    stop: Option<oneshot::Sender<()>>,
}

impl CleanupHandle {
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_transaction_once() {
        let collector = MetricsCollector::new();
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        collector.start(a, "postgres");
        collector.start(b, "postgres");
        collector.start(c, "postgres");
        collector.record_operation(a);
        collector.record_operation(a);

        assert!(collector.finish(a, TransactionStatus::Committed, Duration::from_millis(10), None));
        assert!(!collector.finish(a, TransactionStatus::RolledBack, Duration::from_millis(10), None));
        assert!(collector.finish(b, TransactionStatus::RolledBack, Duration::from_millis(30), None));

        let global = collector.global();
        assert_eq!(global.total_transactions, 3);
        assert_eq!(global.active_transactions, 1);
        assert_eq!(global.committed_transactions, 1);
        assert_eq!(global.rolled_back_transactions, 1);
        assert_eq!(global.average_duration, Duration::from_millis(20));
        assert_eq!(global.success_rate, 0.5);

        let record = collector.transaction(a).unwrap();
        assert_eq!(record.operation_count, 2);
        assert_eq!(record.status, TransactionStatus::Committed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn failures_keep_the_error() {
        let collector = MetricsCollector::new();
        let id = Ulid::new();
        collector.start(id, "postgres");
        collector.finish(id, TransactionStatus::Failed, Duration::from_millis(1), Some(&DocumentError::TransactionAborted));
        let record = collector.transaction(id).unwrap();
        assert_eq!(record.error_message.as_deref(), Some("transaction aborted by a previous error and was rolled back"));
        assert_eq!(collector.global().failed_transactions, 1);
    }

    #[test]
    fn cleanup_keeps_active_transactions() {
        let collector = MetricsCollector::new();
        let (done, running) = (Ulid::new(), Ulid::new());
        collector.start(done, "postgres");
        collector.start(running, "postgres");
        collector.finish(done, TransactionStatus::Committed, Duration::from_millis(1), None);

        assert_eq!(collector.cleanup_completed_transactions(Duration::from_secs(3600)), 0);
        assert_eq!(collector.cleanup_completed_transactions(Duration::ZERO), 1);
        assert!(collector.transaction(done).is_none());
        assert!(collector.transaction(running).is_some());
    }

    #[tokio::test]
    async fn periodic_cleanup_runs_until_stopped() {
        let collector = Arc::new(MetricsCollector::new());
        let id = Ulid::new();
        collector.start(id, "postgres");
        collector.finish(id, TransactionStatus::Committed, Duration::from_millis(1), None);

        let handle = collector.spawn_cleanup(Duration::from_millis(10), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(collector.transactions().is_empty());
        handle.stop();
    }
}
