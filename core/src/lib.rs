pub mod document;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod transaction;
pub mod update;
pub mod util;

pub use document::Document;
pub use error::{DocumentError, ErrorClass, TranslationError};
pub use filter::{Clause, ComparisonOperator, Condition, FieldPath, Filter};
pub use metrics::{GlobalMetrics, MetricsCollector, TransactionMetrics, TransactionStatus};
pub use query::{Cursor, CursorQuery, FindOptions, IndexInfo, IndexSpec, Page, SortDirection, SortField, UpdateOptions, UpdateResult};
pub use storage::{DocumentStore, OwnershipGuard, Transaction, TransactionManager};
pub use transaction::{IsolationLevel, RetryPolicy, TransactionConfig};
pub use update::{Increment, Update};
