use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::document::Document;
use crate::error::DocumentError;
use crate::filter::Filter;
use crate::metrics::TransactionMetrics;
use crate::query::{CursorQuery, FindOptions, IndexInfo, IndexSpec, Page, UpdateOptions, UpdateResult};
use crate::transaction::TransactionConfig;
use crate::update::Update;

/// Collection oriented document operations.
///
/// Implemented by the store itself (each call runs on its own pooled
/// connection) and by a transaction (every call runs on the transaction's
/// connection).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Make sure the backing table exists. Returns false when the table is
    /// missing and could not be created (inside a read-only transaction).
    async fn ensure_table(&self, collection: &str) -> Result<bool, DocumentError>;

    /// Insert one document, returning its surrogate id.
    async fn save<D: Document>(&self, collection: &str, document: &D) -> Result<i64, DocumentError>;

    /// Insert many documents in one statement. Ids come back in input order.
    async fn save_many<D: Document>(&self, collection: &str, documents: &[D]) -> Result<Vec<i64>, DocumentError>;

    async fn find<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<D>, DocumentError>;

    /// First match, or [`DocumentError::NoDocuments`].
    async fn find_one<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter) -> Result<D, DocumentError>;

    /// Update the first match.
    async fn update(&self, collection: &str, filter: &Filter, update: &Update, options: UpdateOptions) -> Result<UpdateResult, DocumentError>;

    async fn update_many(&self, collection: &str, filter: &Filter, update: &Update, options: UpdateOptions) -> Result<UpdateResult, DocumentError>;

    /// Delete the first match, returning the number of removed rows.
    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError>;

    /// Delete everything each filter matches, all or nothing.
    async fn delete_many(&self, collection: &str, filters: &[Filter]) -> Result<u64, DocumentError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError>;

    /// Unique values of one field among the matching documents
    async fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> Result<Vec<Value>, DocumentError>;

    async fn find_with_cursor<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter, query: &CursorQuery) -> Result<Page<D>, DocumentError>;

    /// Create an expression index, returning its name. Creating an index
    /// that already exists succeeds.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, DocumentError>;

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), DocumentError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DocumentError>;

    async fn aggregate(&self, _collection: &str, _pipeline: &[Value]) -> Result<Vec<Value>, DocumentError> {
        Err(DocumentError::Unsupported("aggregate"))
    }

    async fn bulk_write(&self, _collection: &str, _operations: &[Value]) -> Result<u64, DocumentError> {
        Err(DocumentError::Unsupported("bulk_write"))
    }
}

/// Mutations that only succeed for the document's owner.
///
/// Each call is a single statement: the id, owner and not-deleted checks are
/// part of its WHERE clause. When nothing matches the caller gets
/// [`DocumentError::NotFoundOrUnauthorized`] and cannot tell which check failed.
#[async_trait]
pub trait OwnershipGuard: Send + Sync {
    async fn update_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str, fields: &Map<String, Value>) -> Result<(), DocumentError>;

    async fn increment_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str, deltas: &Map<String, Value>) -> Result<(), DocumentError>;

    /// Soft delete: marks the document deleted and stamps `deleted_date`.
    async fn delete_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str) -> Result<(), DocumentError>;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Transaction: Transaction;

    async fn begin(&self) -> Result<Self::Transaction, DocumentError>;

    async fn begin_with_config(&self, config: TransactionConfig) -> Result<Self::Transaction, DocumentError>;

    /// Older entry point, same as [`begin`](Self::begin).
    async fn start_transaction(&self) -> Result<Self::Transaction, DocumentError> { self.begin().await }
}

/// An open transaction. Commit and rollback may be called any number of
/// times from any task: the first call does the work, the rest return Ok.
#[async_trait]
pub trait Transaction: DocumentStore + OwnershipGuard {
    async fn commit(&self) -> Result<(), DocumentError>;

    async fn rollback(&self) -> Result<(), DocumentError>;

    /// Make in-flight and future operations fail with [`DocumentError::Cancelled`].
    fn cancel(&self);

    fn is_active(&self) -> bool;

    fn transaction_id(&self) -> Ulid;

    fn config(&self) -> &TransactionConfig;

    fn metrics(&self) -> Option<TransactionMetrics>;
}
