//! Public error types for docstore.
//!
//! Every repository and transaction operation resolves to a [`DocumentError`].
//! The variants are classified so calling services can map them to domain
//! responses (not-found vs. forbidden vs. conflict) without matching on text.

use thiserror::Error;

/// A malformed filter or update descriptor.
///
/// Always raised before any statement is sent to the database.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TranslationError {
    #[error("expected {expected}, got {given}")]
    NotAnObject { expected: &'static str, given: String },

    #[error("invalid field path '{0}'")]
    InvalidPath(String),

    #[error("unsupported operator {operator} on field '{field}'")]
    UnsupportedOperator { field: String, operator: String },

    #[error("operator {operator} on field '{field}' expects {expected}")]
    InvalidOperand { field: String, operator: String, expected: &'static str },

    #[error("field '{field}' has {count} comparison operators, exactly one is allowed")]
    MultipleOperators { field: String, count: usize },

    #[error("increment for field '{field}' is not numeric: {value}")]
    NonNumericIncrement { field: String, value: String },

    #[error("field '{0}' cannot be modified")]
    ImmutableField(String),

    #[error("update descriptor is empty")]
    EmptyUpdate,
}

/// Coarse classes of failure, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    SerializationFailure,
    Deadlock,
    Connection,
    Timeout,
    Other,
}

impl ErrorClass {
    /// Classify a five character SQLSTATE code.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "40001" => ErrorClass::SerializationFailure,
            "40P01" => ErrorClass::Deadlock,
            "57014" | "55P03" => ErrorClass::Timeout,
            "57P01" | "57P02" | "57P03" => ErrorClass::Connection,
            code if code.starts_with("08") => ErrorClass::Connection,
            _ => ErrorClass::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    /// The filter or update could not be turned into SQL
    #[error("invalid query: {0}")]
    Translation(#[from] TranslationError),

    /// Unique constraint violation on `object_id`
    #[error("duplicate key in collection {collection}: {detail}")]
    DuplicateKey { collection: String, detail: String },

    /// A single-result query matched zero rows
    #[error("no documents in result")]
    NoDocuments,

    /// The requested feature is intentionally not implemented
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// An ownership-scoped mutation affected no rows
    #[error("not found or unauthorized")]
    NotFoundOrUnauthorized,

    #[error("transaction is not active")]
    TransactionInactive,

    /// An earlier statement failed and the database discarded the transaction
    #[error("transaction aborted by a previous error and was rolled back")]
    TransactionAborted,

    #[error("nested transactions are not supported")]
    NestedTransaction,

    #[error("transaction deadline exceeded")]
    Timeout,

    #[error("transaction cancelled")]
    Cancelled,

    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    /// Anything the driver reported that is not classified above
    #[error("{operation} on '{collection}' failed: {message}")]
    Driver {
        operation: &'static str,
        collection: String,
        /// SQLSTATE, when the server produced one
        code: Option<String>,
        /// The server's message, or the driver's when there is none
        message: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl DocumentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DocumentError::Timeout => ErrorClass::Timeout,
            DocumentError::Pool(_) => ErrorClass::Connection,
            DocumentError::Driver { code: Some(code), .. } => ErrorClass::from_sqlstate(code),
            _ => ErrorClass::Other,
        }
    }

    pub fn is_duplicate_key(&self) -> bool { matches!(self, DocumentError::DuplicateKey { .. }) }

    pub fn is_no_documents(&self) -> bool { matches!(self, DocumentError::NoDocuments) }

    /// SQLSTATE of a driver error, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            DocumentError::Driver { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sqlstates() {
        assert_eq!(ErrorClass::from_sqlstate("40001"), ErrorClass::SerializationFailure);
        assert_eq!(ErrorClass::from_sqlstate("40P01"), ErrorClass::Deadlock);
        assert_eq!(ErrorClass::from_sqlstate("08006"), ErrorClass::Connection);
        assert_eq!(ErrorClass::from_sqlstate("57014"), ErrorClass::Timeout);
        assert_eq!(ErrorClass::from_sqlstate("23505"), ErrorClass::Other);
    }

    #[test]
    fn driver_errors_expose_their_class() {
        let err = DocumentError::Driver {
            operation: "update",
            collection: "posts".into(),
            code: Some("40001".into()),
            message: "could not serialize access".into(),
            source: "could not serialize access".into(),
        };
        assert_eq!(err.class(), ErrorClass::SerializationFailure);
        assert_eq!(err.code(), Some("40001"));
        assert_eq!(err.to_string(), "update on 'posts' failed: could not serialize access");
        assert_eq!(DocumentError::NoDocuments.class(), ErrorClass::Other);
        assert!(DocumentError::NoDocuments.is_no_documents());
    }
}
