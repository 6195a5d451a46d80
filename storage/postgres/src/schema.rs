use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use docstore_core::error::DocumentError;
use docstore_core::query::{IndexInfo, IndexSpec};
use sha2::{Digest, Sha256};
use tokio_postgres::GenericClient;
use tracing::{debug, info, warn};

use crate::error::{driver_error, is_ddl_race};
use crate::repository::Mode;
use crate::sql_builder::{quote_identifier, text_path, DATA};
use crate::Postgres;

const DDL_SAVEPOINT: &str = "docstore_ddl";

/// NAMEDATALEN - 1; the server truncates longer identifiers
const MAX_IDENTIFIER_BYTES: usize = 63;
const NAME_HASH_CHARS: usize = 8;

/// Creates collection tables on first use and remembers which exist.
///
/// Only tables seen outside a transaction are cached: a table created inside
/// a transaction disappears again if that transaction rolls back.
#[derive(Debug, Default)]
pub struct TableManager {
    known: RwLock<HashSet<String>>,
    ddl_lock: tokio::sync::Mutex<()>,
}

impl TableManager {
    pub fn new() -> Self { Self::default() }

    pub fn is_known(&self, collection: &str) -> bool { self.known.read().unwrap_or_else(PoisonError::into_inner).contains(collection) }

    pub fn forget(&self, collection: &str) { self.known.write().unwrap_or_else(PoisonError::into_inner).remove(collection); }

    fn remember(&self, collection: &str) { self.known.write().unwrap_or_else(PoisonError::into_inner).insert(collection.to_owned()); }

    /// Returns false only when the table is missing and `mode` is a read-only
    /// transaction, which cannot create it.
    pub async fn ensure<C: GenericClient + Sync>(&self, client: &C, collection: &str, mode: Mode) -> Result<bool, DocumentError> {
        if self.is_known(collection) {
            return Ok(true);
        }

        if table_exists(client, collection).await? {
            if mode == Mode::Autocommit {
                self.remember(collection);
            }
            return Ok(true);
        }

        match mode {
            Mode::Transaction { read_only: true } => {
                debug!("Postgres({}).ensure_table: missing, read-only transaction", collection);
                Ok(false)
            }
            Mode::Transaction { read_only: false } => {
                execute_ddl(client, collection, &create_table_sql(collection), mode).await?;
                Ok(true)
            }
            Mode::Autocommit => {
                let _guard = self.ddl_lock.lock().await;
                if self.is_known(collection) {
                    return Ok(true);
                }
                execute_ddl(client, collection, &create_table_sql(collection), mode).await?;
                self.remember(collection);
                Ok(true)
            }
        }
    }
}

async fn table_exists<C: GenericClient + Sync>(client: &C, collection: &str) -> Result<bool, DocumentError> {
    let query = r#"SELECT EXISTS (
            SELECT 1 FROM pg_catalog.pg_class c JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = current_schema() AND c.relname = $1 AND c.relkind IN ('r', 'p')
        )"#;
    let row = client.query_one(query, &[&collection]).await.map_err(|err| driver_error("ensure_table", collection, err))?;
    row.try_get(0).map_err(|err| driver_error("ensure_table", collection, err))
}

pub fn create_table_sql(collection: &str) -> String {
    let table = quote_identifier(collection);
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
                "id" BIGSERIAL PRIMARY KEY,
                "object_id" TEXT NOT NULL UNIQUE,
                "data" JSONB NOT NULL,
                "created_date" BIGINT NOT NULL DEFAULT 0,
                "last_updated" BIGINT NOT NULL DEFAULT 0,
                "inserted_at" TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS {created} ON {table} ("created_date");
            CREATE INDEX IF NOT EXISTS {updated} ON {table} ("last_updated");
            CREATE INDEX IF NOT EXISTS {gin} ON {table} USING GIN ("data");"#,
        created = quote_identifier(&derived_name(format!("{collection}_created_date_idx"))),
        updated = quote_identifier(&derived_name(format!("{collection}_last_updated_idx"))),
        gin = quote_identifier(&derived_name(format!("{collection}_data_gin_idx"))),
    )
}

/// A generated identifier that fits the server's limit. Longer names keep a
/// prefix and end in a hash of the full name, so they stay distinct.
pub fn derived_name(name: String) -> String {
    if name.len() <= MAX_IDENTIFIER_BYTES {
        return name;
    }
    let digest = Sha256::digest(name.as_bytes());
    let hash: String = digest.iter().take(NAME_HASH_CHARS / 2).map(|byte| format!("{byte:02x}")).collect();

    let mut end = MAX_IDENTIFIER_BYTES - NAME_HASH_CHARS - 1;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{}", &name[..end], hash)
}

/// Run DDL, treating a lost creation race as success. Inside a transaction
/// the statement runs under a savepoint so a failure does not abort the
/// caller's transaction.
async fn execute_ddl<C: GenericClient + Sync>(client: &C, collection: &str, ddl: &str, mode: Mode) -> Result<(), DocumentError> {
    info!("Postgres({}).ddl: {}", collection, ddl);
    let in_transaction = matches!(mode, Mode::Transaction { .. });
    if in_transaction {
        client.batch_execute(&format!("SAVEPOINT {DDL_SAVEPOINT}")).await.map_err(|err| driver_error("ddl", collection, err))?;
    }

    let (outcome, failed) = match client.batch_execute(ddl).await {
        Ok(()) => (Ok(()), false),
        Err(err) if is_ddl_race(&err) => {
            warn!("Postgres({}).ddl: lost creation race, object exists: {:?}", collection, err);
            (Ok(()), true)
        }
        Err(err) => (Err(driver_error("ddl", collection, err)), true),
    };

    if in_transaction {
        let finish = if failed {
            format!("ROLLBACK TO SAVEPOINT {DDL_SAVEPOINT}; RELEASE SAVEPOINT {DDL_SAVEPOINT}")
        } else {
            format!("RELEASE SAVEPOINT {DDL_SAVEPOINT}")
        };
        client.batch_execute(&finish).await.map_err(|err| driver_error("ddl", collection, err))?;
    }
    outcome
}

pub fn index_name(collection: &str, index: &IndexSpec) -> String {
    match &index.name {
        Some(name) => name.clone(),
        None => derived_name(format!("{}_{}_idx", collection, index.field.segments().join("_"))),
    }
}

pub async fn create_index<C: GenericClient + Sync>(client: &C, collection: &str, index: &IndexSpec, mode: Mode) -> Result<String, DocumentError> {
    let name = index_name(collection, index);
    if !Postgres::sane_name(&name) {
        return Err(DocumentError::InvalidConfig(format!("invalid index name: {name}")));
    }
    let ddl = format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} (({}))",
        if index.unique { "UNIQUE " } else { "" },
        quote_identifier(&name),
        quote_identifier(collection),
        text_path(DATA, &index.field)
    );
    execute_ddl(client, collection, &ddl, mode).await?;
    Ok(name)
}

pub async fn drop_index<C: GenericClient + Sync>(client: &C, collection: &str, name: &str, mode: Mode) -> Result<(), DocumentError> {
    let query = "SELECT 1 FROM pg_indexes WHERE schemaname = current_schema() AND tablename = $1 AND indexname = $2";
    let found = client.query_opt(query, &[&collection, &name]).await.map_err(|err| driver_error("drop_index", collection, err))?;
    if found.is_none() {
        debug!("Postgres({}).drop_index: {} does not exist", collection, name);
        return Ok(());
    }
    execute_ddl(client, collection, &format!("DROP INDEX IF EXISTS {}", quote_identifier(name)), mode).await
}

pub async fn list_indexes<C: GenericClient + Sync>(client: &C, collection: &str) -> Result<Vec<IndexInfo>, DocumentError> {
    let query = "SELECT indexname, indexdef FROM pg_indexes WHERE schemaname = current_schema() AND tablename = $1 ORDER BY indexname";
    let rows = client.query(query, &[&collection]).await.map_err(|err| driver_error("list_indexes", collection, err))?;
    rows.iter()
        .map(|row| {
            Ok(IndexInfo {
                name: row.try_get(0).map_err(|err| driver_error("list_indexes", collection, err))?,
                definition: row.try_get(1).map_err(|err| driver_error("list_indexes", collection, err))?,
            })
        })
        .collect()
}
