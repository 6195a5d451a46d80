use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_postgres::{tokio_postgres::NoTls, PostgresConnectionManager};
use docstore_core::document::{to_body, Document};
use docstore_core::error::DocumentError;
use docstore_core::filter::Filter;
use docstore_core::metrics::{MetricsCollector, TransactionMetrics, TransactionStatus};
use docstore_core::query::{CursorQuery, FindOptions, IndexInfo, IndexSpec, Page, UpdateOptions, UpdateResult};
use docstore_core::storage::{DocumentStore, OwnershipGuard, Transaction, TransactionManager};
use docstore_core::transaction::TransactionConfig;
use docstore_core::update::Update;
use docstore_core::util::OneTimeFlag;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::error::{driver_error, error_kind, ErrorKind};
use crate::repository::{Mode, Repository};
use crate::schema::TableManager;
use crate::{decode, decode_page};

pub(crate) type PooledClient = PooledConnection<'static, PostgresConnectionManager<NoTls>>;

pub const DATABASE_TYPE: &str = "postgres";

/// A bare COMMIT on an aborted transaction rolls back and still succeeds.
/// The leading SELECT fails with `in_failed_sql_transaction` instead, and
/// the COMMIT after it never runs.
const COMMIT: &str = "SELECT 1; COMMIT";

/// A transaction holding one pooled connection until it commits or rolls
/// back. Operations are serialized on that connection.
pub struct PostgresTransaction {
    id: Ulid,
    config: TransactionConfig,
    connection: Mutex<Option<PooledClient>>,
    active: AtomicBool,
    /// A statement failed, so the server will only accept a rollback
    aborted: AtomicBool,
    operations: AtomicU64,
    cancel: OneTimeFlag,
    started: Instant,
    deadline: tokio::time::Instant,
    tables: Arc<TableManager>,
    metrics: Arc<MetricsCollector>,
    owner_field: String,
}

impl PostgresTransaction {
    pub(crate) fn new(
        id: Ulid,
        config: TransactionConfig,
        connection: PooledClient,
        tables: Arc<TableManager>,
        metrics: Arc<MetricsCollector>,
        owner_field: String,
    ) -> Self {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + config.timeout;
        Self {
            id,
            config,
            connection: Mutex::new(Some(connection)),
            active: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            operations: AtomicU64::new(0),
            cancel: OneTimeFlag::new(),
            started,
            deadline,
            tables,
            metrics,
            owner_field,
        }
    }

    /// Mutating operations run so far
    pub fn operation_count(&self) -> u64 { self.operations.load(Ordering::Acquire) }

    fn repository(&self) -> Repository<'_> {
        Repository::new(&self.tables, &self.owner_field, Mode::Transaction { read_only: self.config.read_only })
    }

    fn check(&self) -> Result<(), DocumentError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(DocumentError::TransactionInactive);
        }
        if self.cancel.is_set() {
            return Err(DocumentError::Cancelled);
        }
        if tokio::time::Instant::now() >= self.deadline {
            return Err(DocumentError::Timeout);
        }
        Ok(())
    }

    /// The transaction's connection, once it is free. Mutating calls are
    /// counted here, before anything executes.
    async fn client(&self, mutating: bool) -> Result<MappedMutexGuard<'_, tokio_postgres::Client>, DocumentError> {
        self.check()?;
        if mutating {
            self.operations.fetch_add(1, Ordering::AcqRel);
            self.metrics.record_operation(self.id);
        }
        let slot = self.race(async { Ok(self.connection.lock().await) }).await?;
        MutexGuard::try_map(slot, |slot| slot.as_mut().map(|connection| &mut **connection)).map_err(|_| DocumentError::TransactionInactive)
    }

    /// Run `operation` unless the transaction is cancelled or its deadline
    /// passes first.
    async fn race<T>(&self, operation: impl Future<Output = Result<T, DocumentError>> + Send) -> Result<T, DocumentError> {
        tokio::select! {
            biased;
            _ = self.cancel.wait() => Err(DocumentError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(DocumentError::Timeout),
            result = operation => result,
        }
    }

    /// [`race`](Self::race), remembering statement failures so commit can
    /// refuse to commit a transaction the server already aborted.
    async fn guarded<T>(&self, operation: impl Future<Output = Result<T, DocumentError>> + Send) -> Result<T, DocumentError> {
        let result = self.race(operation).await;
        if let Err(DocumentError::Driver { .. } | DocumentError::DuplicateKey { .. }) = &result {
            self.aborted.store(true, Ordering::Release);
        }
        result
    }

    fn finish(&self, status: TransactionStatus, error: Option<&DocumentError>) { self.metrics.finish(self.id, status, self.started.elapsed(), error); }

    /// Roll back a transaction the server aborted, reporting it as failed.
    async fn abandon(&self, connection: &PooledClient) -> DocumentError {
        if let Err(err) = connection.batch_execute("ROLLBACK").await {
            warn!("PostgresTransaction({}).commit: rollback of aborted transaction failed: {:?}", self.id, err);
        }
        let err = DocumentError::TransactionAborted;
        self.finish(TransactionStatus::Failed, Some(&err));
        err
    }

    /// Take the connection out for the final statement. Only the caller that
    /// flips the transaction inactive gets it.
    async fn close(&self) -> Option<PooledClient> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.connection.lock().await.take()
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(&self) -> Result<(), DocumentError> {
        if !self.active.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.cancel.is_set() {
            return Err(DocumentError::Cancelled);
        }
        if tokio::time::Instant::now() >= self.deadline {
            return Err(DocumentError::Timeout);
        }
        let Some(connection) = self.close().await else { return Ok(()) };

        if self.aborted.load(Ordering::Acquire) {
            return Err(self.abandon(&connection).await);
        }

        match connection.batch_execute(COMMIT).await {
            Ok(()) => {
                info!("PostgresTransaction({}).commit: {} operations in {:?}", self.id, self.operation_count(), self.started.elapsed());
                self.finish(TransactionStatus::Committed, None);
                Ok(())
            }
            Err(err) if error_kind(&err) == ErrorKind::InFailedTransaction => {
                warn!("PostgresTransaction({}).commit: server had already aborted the transaction", self.id);
                Err(self.abandon(&connection).await)
            }
            Err(err) => {
                let err = driver_error("commit", &self.id.to_string(), err);
                self.finish(TransactionStatus::Failed, Some(&err));
                Err(err)
            }
        }
    }

    async fn rollback(&self) -> Result<(), DocumentError> {
        let Some(connection) = self.close().await else { return Ok(()) };
        match connection.batch_execute("ROLLBACK").await {
            Ok(()) => {
                info!("PostgresTransaction({}).rollback", self.id);
                self.finish(TransactionStatus::RolledBack, None);
                Ok(())
            }
            Err(err) => {
                let err = driver_error("rollback", &self.id.to_string(), err);
                self.finish(TransactionStatus::Failed, Some(&err));
                Err(err)
            }
        }
    }

    fn cancel(&self) {
        if self.cancel.set() {
            info!("PostgresTransaction({}).cancel", self.id);
        }
    }

    fn is_active(&self) -> bool { self.active.load(Ordering::Acquire) }

    fn transaction_id(&self) -> Ulid { self.id }

    fn config(&self) -> &TransactionConfig { &self.config }

    fn metrics(&self) -> Option<TransactionMetrics> { self.metrics.transaction(self.id) }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("PostgresTransaction({}).drop: dropped while active, rolling back", self.id);
        self.finish(TransactionStatus::RolledBack, None);

        let Some(connection) = self.connection.get_mut().take() else { return };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = connection.batch_execute("ROLLBACK").await {
                        warn!("PostgresTransaction({}).drop: rollback failed: {:?}", id, err);
                    }
                });
            }
            Err(_) => warn!("PostgresTransaction({}).drop: no runtime to roll back on", id),
        }
    }
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("operations", &self.operation_count())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl TransactionManager for PostgresTransaction {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction, DocumentError> { Err(DocumentError::NestedTransaction) }

    async fn begin_with_config(&self, _config: TransactionConfig) -> Result<PostgresTransaction, DocumentError> { Err(DocumentError::NestedTransaction) }

    async fn start_transaction(&self) -> Result<PostgresTransaction, DocumentError> { Err(DocumentError::NestedTransaction) }
}

#[async_trait]
impl DocumentStore for PostgresTransaction {
    async fn ensure_table(&self, collection: &str) -> Result<bool, DocumentError> {
        let client = self.client(false).await?;
        self.guarded(self.repository().ensure_table(&*client, collection)).await
    }

    async fn save<D: Document>(&self, collection: &str, document: &D) -> Result<i64, DocumentError> {
        let client = self.client(true).await?;
        let body = to_body(document)?;
        self.guarded(self.repository().save(&*client, collection, body)).await
    }

    async fn save_many<D: Document>(&self, collection: &str, documents: &[D]) -> Result<Vec<i64>, DocumentError> {
        let client = self.client(true).await?;
        let bodies = documents.iter().map(to_body).collect::<Result<Vec<_>, _>>()?;
        self.guarded(self.repository().save_many(&*client, collection, bodies)).await
    }

    async fn find<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<D>, DocumentError> {
        let client = self.client(false).await?;
        decode(self.guarded(self.repository().find(&*client, collection, filter, options)).await?)
    }

    async fn find_one<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter) -> Result<D, DocumentError> {
        let client = self.client(false).await?;
        let value = self.guarded(self.repository().find_one(&*client, collection, filter)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update(&self, collection: &str, filter: &Filter, update: &Update, options: UpdateOptions) -> Result<UpdateResult, DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().update(&*client, collection, filter, update, options, false)).await
    }

    async fn update_many(&self, collection: &str, filter: &Filter, update: &Update, options: UpdateOptions) -> Result<UpdateResult, DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().update(&*client, collection, filter, update, options, true)).await
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().delete(&*client, collection, filter)).await
    }

    async fn delete_many(&self, collection: &str, filters: &[Filter]) -> Result<u64, DocumentError> {
        let mut client = self.client(true).await?;
        // a failed batch is rolled back to its savepoint, the transaction stays usable
        self.race(self.repository().delete_many(&mut *client, collection, filters)).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let client = self.client(false).await?;
        self.guarded(self.repository().count(&*client, collection, filter)).await
    }

    async fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> Result<Vec<Value>, DocumentError> {
        let client = self.client(false).await?;
        self.guarded(self.repository().distinct(&*client, collection, field, filter)).await
    }

    async fn find_with_cursor<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter, query: &CursorQuery) -> Result<Page<D>, DocumentError> {
        let client = self.client(false).await?;
        decode_page(self.guarded(self.repository().find_with_cursor(&*client, collection, filter, query)).await?)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().create_index(&*client, collection, index)).await
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().drop_index(&*client, collection, name)).await
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DocumentError> {
        let client = self.client(false).await?;
        self.guarded(self.repository().list_indexes(&*client, collection)).await
    }
}

#[async_trait]
impl OwnershipGuard for PostgresTransaction {
    async fn update_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str, fields: &Map<String, Value>) -> Result<(), DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().update_with_ownership(&*client, collection, entity_id, owner_id, fields)).await
    }

    async fn increment_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str, deltas: &Map<String, Value>) -> Result<(), DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().increment_with_ownership(&*client, collection, entity_id, owner_id, deltas)).await
    }

    async fn delete_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str) -> Result<(), DocumentError> {
        let client = self.client(true).await?;
        self.guarded(self.repository().delete_with_ownership(&*client, collection, entity_id, owner_id)).await
    }
}
