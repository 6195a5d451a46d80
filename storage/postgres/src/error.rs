use docstore_core::error::DocumentError;
use tokio_postgres::error::SqlState;
use tracing::error;

/// What a driver error means to the repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UniqueViolation,
    UndefinedTable,
    /// `duplicate_table` or `duplicate_object`, raised by racing DDL
    DuplicateObject,
    /// `in_failed_sql_transaction`: an earlier statement aborted the transaction
    InFailedTransaction,
    Unknown,
}

pub fn error_kind(err: &tokio_postgres::Error) -> ErrorKind {
    match err.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => ErrorKind::UniqueViolation,
        Some(code) if *code == SqlState::UNDEFINED_TABLE => ErrorKind::UndefinedTable,
        Some(code) if *code == SqlState::DUPLICATE_TABLE || *code == SqlState::DUPLICATE_OBJECT => ErrorKind::DuplicateObject,
        Some(code) if *code == SqlState::IN_FAILED_SQL_TRANSACTION => ErrorKind::InFailedTransaction,
        _ => ErrorKind::Unknown,
    }
}

/// Concurrent `CREATE ... IF NOT EXISTS` statements can still collide on the
/// catalog; the loser sees one of these and the object exists either way.
pub fn is_ddl_race(err: &tokio_postgres::Error) -> bool {
    match error_kind(err) {
        ErrorKind::DuplicateObject => true,
        // a catalog collision, not duplicate rows under a new unique index
        ErrorKind::UniqueViolation => err.as_db_error().and_then(|db| db.constraint()).is_some_and(|constraint| constraint.starts_with("pg_")),
        _ => false,
    }
}

pub fn driver_error(operation: &'static str, collection: &str, err: tokio_postgres::Error) -> DocumentError {
    if error_kind(&err) == ErrorKind::UniqueViolation {
        let detail = match err.as_db_error() {
            Some(db) => match db.detail() {
                Some(detail) => format!("{} ({})", db.message(), detail),
                None => db.message().to_owned(),
            },
            None => err.to_string(),
        };
        return DocumentError::DuplicateKey { collection: collection.to_owned(), detail };
    }

    let code = match err.code() {
        Some(code) => Some(code.code().to_owned()),
        None if err.is_closed() => Some(SqlState::CONNECTION_FAILURE.code().to_owned()),
        None => None,
    };
    // the driver's Display is only "db error"
    let message = match err.as_db_error() {
        Some(db) => db.message().to_owned(),
        None => err.to_string(),
    };
    error!("Postgres({}).{}: Error: {:?}", collection, operation, err);
    DocumentError::Driver { operation, collection: collection.to_owned(), code, message, source: Box::new(err) }
}

pub fn pool_error(err: bb8::RunError<tokio_postgres::Error>) -> DocumentError {
    match err {
        bb8::RunError::User(err) => DocumentError::Pool(err.to_string()),
        bb8::RunError::TimedOut => DocumentError::Pool("timed out waiting for a connection".to_owned()),
    }
}
