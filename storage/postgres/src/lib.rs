use std::sync::Arc;

use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_postgres::{tokio_postgres::NoTls, PostgresConnectionManager};
use docstore_core::document::{to_body, Document, DEFAULT_OWNER_FIELD};
use docstore_core::error::DocumentError;
use docstore_core::filter::Filter;
use docstore_core::metrics::{GlobalMetrics, MetricsCollector};
use docstore_core::query::{CursorQuery, FindOptions, IndexInfo, IndexSpec, Page, UpdateOptions, UpdateResult};
use docstore_core::storage::{DocumentStore, OwnershipGuard, Transaction, TransactionManager};
use docstore_core::transaction::TransactionConfig;
use docstore_core::update::Update;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{info, warn};
use ulid::Ulid;

pub mod error;
pub mod ownership;
pub mod predicate;
pub mod repository;
pub mod schema;
pub mod sql_builder;
pub mod transaction;
pub mod update;
pub mod value;

use error::{driver_error, pool_error};
use repository::{Mode, Repository};
use schema::TableManager;
pub use transaction::PostgresTransaction;
use transaction::DATABASE_TYPE;

const DEFAULT_POOL_SIZE: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    /// Document field holding the owner id, checked by the ownership guard
    pub owner_field: String,
    /// Used by `begin()`, and for any zero timeout passed to `begin_with_config`
    pub default_transaction: TransactionConfig,
    /// Connections opened by [`Postgres::connect`]
    pub pool_size: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self { Self { owner_field: DEFAULT_OWNER_FIELD.to_owned(), default_transaction: TransactionConfig::default(), pool_size: DEFAULT_POOL_SIZE } }
}

impl PostgresConfig {
    pub fn with_owner_field(mut self, owner_field: impl Into<String>) -> Self {
        self.owner_field = owner_field.into();
        self
    }

    pub fn with_default_transaction(mut self, config: TransactionConfig) -> Self {
        self.default_transaction = config;
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }
}

pub struct Postgres {
    pool: bb8::Pool<PostgresConnectionManager<NoTls>>,
    tables: Arc<TableManager>,
    metrics: Arc<MetricsCollector>,
    config: PostgresConfig,
}

impl Postgres {
    pub fn new(pool: bb8::Pool<PostgresConnectionManager<NoTls>>) -> anyhow::Result<Self> {
        Ok(Self { pool, tables: Arc::new(TableManager::new()), metrics: Arc::new(MetricsCollector::new()), config: PostgresConfig::default() })
    }

    /// Build a pool of `config.pool_size` connections from a libpq style
    /// connection string.
    pub async fn connect(connection_string: &str, config: PostgresConfig) -> anyhow::Result<Self> {
        let manager = PostgresConnectionManager::new_from_stringlike(connection_string, NoTls)?;
        let pool = bb8::Pool::builder().max_size(config.pool_size.max(1)).build(manager).await?;
        Ok(Self::new(pool)?.with_config(config))
    }

    pub fn with_config(mut self, config: PostgresConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a collector between stores, or hand in one a test inspects.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PostgresConfig { &self.config }

    pub fn metrics(&self) -> &Arc<MetricsCollector> { &self.metrics }

    pub fn global_metrics(&self) -> GlobalMetrics { self.metrics.global() }

    // TODO: newtype this to `CollectionName(&str)` with a constructor that
    // only accepts a subset of characters.
    pub fn sane_name(collection: &str) -> bool {
        // longer identifiers are silently truncated by the server
        if collection.is_empty() || collection.len() > 63 {
            return false;
        }
        for char in collection.chars() {
            match char {
                char if char.is_alphanumeric() => {}
                '_' | '.' | ':' => {}
                _ => return false,
            }
        }

        true
    }

    fn repository(&self) -> Repository<'_> { Repository::new(&self.tables, &self.config.owner_field, Mode::Autocommit) }

    async fn client(&self) -> Result<PooledConnection<'_, PostgresConnectionManager<NoTls>>, DocumentError> { self.pool.get().await.map_err(pool_error) }

    /// Run `operation` in a transaction, committing when it returns Ok and
    /// rolling back otherwise. Failures the retry policy classifies as
    /// retryable start a fresh transaction after a backoff delay.
    pub async fn run_in_transaction<T, F>(&self, config: TransactionConfig, mut operation: F) -> Result<T, DocumentError>
    where
        T: Send,
        F: for<'t> FnMut(&'t PostgresTransaction) -> BoxFuture<'t, Result<T, DocumentError>> + Send,
    {
        let config = self.merged(config).validated()?;
        let policy = config.retry_policy.clone();
        let mut attempt = 0;
        loop {
            let result = match self.begin_with_config(config.clone()).await {
                Ok(transaction) => match operation(&transaction).await {
                    Ok(value) => transaction.commit().await.map(|()| value),
                    Err(err) => {
                        if let Err(rollback) = transaction.rollback().await {
                            warn!("PostgresTransaction({}).run: rollback failed: {}", transaction.transaction_id(), rollback);
                        }
                        Err(err)
                    }
                },
                Err(err) => Err(err),
            };

            match result {
                Err(err) if attempt < policy.max_retries && policy.is_retryable(&err) => {
                    let delay = policy.delay_for(attempt);
                    warn!("Postgres.run_in_transaction: attempt {} failed ({}), retrying in {:?}", attempt + 1, err, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// A zero timeout means the store's default.
    fn merged(&self, mut config: TransactionConfig) -> TransactionConfig {
        if config.timeout.is_zero() {
            config.timeout = self.config.default_transaction.timeout;
        }
        config
    }
}

#[async_trait]
impl TransactionManager for Postgres {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction, DocumentError> { self.begin_with_config(self.config.default_transaction.clone()).await }

    async fn begin_with_config(&self, config: TransactionConfig) -> Result<PostgresTransaction, DocumentError> {
        let config = self.merged(config).validated()?;
        let connection = self.pool.get_owned().await.map_err(pool_error)?;
        let id = Ulid::new();

        let begin = format!("{}; SET LOCAL statement_timeout = {}", config.begin_statement(), config.timeout.as_millis());
        if let Err(err) = connection.batch_execute(&begin).await {
            // do not hand the connection back to the pool mid-transaction
            let _ = connection.batch_execute("ROLLBACK").await;
            return Err(driver_error("begin", &id.to_string(), err));
        }

        self.metrics.start(id, DATABASE_TYPE);
        info!("PostgresTransaction({}).begin: {} (timeout {:?})", id, config.begin_statement(), config.timeout);
        Ok(PostgresTransaction::new(id, config, connection, self.tables.clone(), self.metrics.clone(), self.config.owner_field.clone()))
    }
}

pub(crate) fn decode<D: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<D>, DocumentError> {
    values.into_iter().map(|value| serde_json::from_value(value).map_err(DocumentError::from)).collect()
}

pub(crate) fn decode_page<D: DeserializeOwned>(page: Page<Value>) -> Result<Page<D>, DocumentError> {
    Ok(Page { items: decode(page.items)?, next_cursor: page.next_cursor, has_more: page.has_more })
}

#[async_trait]
impl DocumentStore for Postgres {
    async fn ensure_table(&self, collection: &str) -> Result<bool, DocumentError> {
        let client = self.client().await?;
        self.repository().ensure_table(&*client, collection).await
    }

    async fn save<D: Document>(&self, collection: &str, document: &D) -> Result<i64, DocumentError> {
        let body = to_body(document)?;
        let client = self.client().await?;
        self.repository().save(&*client, collection, body).await
    }

    async fn save_many<D: Document>(&self, collection: &str, documents: &[D]) -> Result<Vec<i64>, DocumentError> {
        let bodies = documents.iter().map(to_body).collect::<Result<Vec<_>, _>>()?;
        let client = self.client().await?;
        self.repository().save_many(&*client, collection, bodies).await
    }

    async fn find<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<D>, DocumentError> {
        let client = self.client().await?;
        decode(self.repository().find(&*client, collection, filter, options).await?)
    }

    async fn find_one<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter) -> Result<D, DocumentError> {
        let client = self.client().await?;
        let value = self.repository().find_one(&*client, collection, filter).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update(&self, collection: &str, filter: &Filter, update: &Update, options: UpdateOptions) -> Result<UpdateResult, DocumentError> {
        let client = self.client().await?;
        self.repository().update(&*client, collection, filter, update, options, false).await
    }

    async fn update_many(&self, collection: &str, filter: &Filter, update: &Update, options: UpdateOptions) -> Result<UpdateResult, DocumentError> {
        let client = self.client().await?;
        self.repository().update(&*client, collection, filter, update, options, true).await
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let client = self.client().await?;
        self.repository().delete(&*client, collection, filter).await
    }

    async fn delete_many(&self, collection: &str, filters: &[Filter]) -> Result<u64, DocumentError> {
        let mut client = self.client().await?;
        self.repository().delete_many(&mut *client, collection, filters).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let client = self.client().await?;
        self.repository().count(&*client, collection, filter).await
    }

    async fn distinct(&self, collection: &str, field: &str, filter: &Filter) -> Result<Vec<Value>, DocumentError> {
        let client = self.client().await?;
        self.repository().distinct(&*client, collection, field, filter).await
    }

    async fn find_with_cursor<D: DeserializeOwned + Send>(&self, collection: &str, filter: &Filter, query: &CursorQuery) -> Result<Page<D>, DocumentError> {
        let client = self.client().await?;
        decode_page(self.repository().find_with_cursor(&*client, collection, filter, query).await?)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<String, DocumentError> {
        let client = self.client().await?;
        self.repository().create_index(&*client, collection, index).await
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), DocumentError> {
        let client = self.client().await?;
        self.repository().drop_index(&*client, collection, name).await
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DocumentError> {
        let client = self.client().await?;
        self.repository().list_indexes(&*client, collection).await
    }
}

#[async_trait]
impl OwnershipGuard for Postgres {
    async fn update_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str, fields: &Map<String, Value>) -> Result<(), DocumentError> {
        let client = self.client().await?;
        self.repository().update_with_ownership(&*client, collection, entity_id, owner_id, fields).await
    }

    async fn increment_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str, deltas: &Map<String, Value>) -> Result<(), DocumentError> {
        let client = self.client().await?;
        self.repository().increment_with_ownership(&*client, collection, entity_id, owner_id, deltas).await
    }

    async fn delete_with_ownership(&self, collection: &str, entity_id: &str, owner_id: &str) -> Result<(), DocumentError> {
        let client = self.client().await?;
        self.repository().delete_with_ownership(&*client, collection, entity_id, owner_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names() {
        assert!(Postgres::sane_name("posts"));
        assert!(Postgres::sane_name("blog.posts_v2"));
        assert!(!Postgres::sane_name(""));
        assert!(!Postgres::sane_name("posts; DROP TABLE users"));
        assert!(!Postgres::sane_name(r#"po"sts"#));
        assert!(!Postgres::sane_name(&"x".repeat(64)));
    }

    #[test]
    fn config_defaults() {
        let config = PostgresConfig::default();
        assert_eq!(config.owner_field, "owner_user_id");
        assert_eq!(config.pool_size, 10);
        let config = config.with_owner_field("author_id").with_pool_size(2);
        assert_eq!(config.owner_field, "author_id");
        assert_eq!(config.pool_size, 2);
    }
}
