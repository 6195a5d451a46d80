use docstore_core::document::{unix_now, DELETED_DATE_FIELD, DELETED_FIELD};
use docstore_core::error::DocumentError;
use docstore_core::filter::FieldPath;
use docstore_core::update::Update;
use serde_json::{Map, Value};
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::repository::Repository;
use crate::sql_builder::{json_path, quote_identifier, text_path, Sql, DATA};
use crate::update::UpdateBuilder;
use crate::value::{params, PGValue};

impl Repository<'_> {
    pub async fn update_with_ownership<C: GenericClient + Sync>(
        &self,
        client: &C,
        collection: &str,
        entity_id: &str,
        owner_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), DocumentError> {
        let update = Update::from_parts(fields, &Map::new())?;
        self.owned_update(client, collection, entity_id, owner_id, &update, "update_with_ownership").await
    }

    pub async fn increment_with_ownership<C: GenericClient + Sync>(
        &self,
        client: &C,
        collection: &str,
        entity_id: &str,
        owner_id: &str,
        deltas: &Map<String, Value>,
    ) -> Result<(), DocumentError> {
        let update = Update::from_parts(&Map::new(), deltas)?;
        self.owned_update(client, collection, entity_id, owner_id, &update, "increment_with_ownership").await
    }

    pub async fn delete_with_ownership<C: GenericClient + Sync>(&self, client: &C, collection: &str, entity_id: &str, owner_id: &str) -> Result<(), DocumentError> {
        let update = Update::new().set(FieldPath::parse(DELETED_FIELD)?, true).set(FieldPath::parse(DELETED_DATE_FIELD)?, unix_now());
        self.owned_update(client, collection, entity_id, owner_id, &update, "delete_with_ownership").await
    }

    /// A single UPDATE whose WHERE clause carries the id, owner and
    /// not-deleted checks, so no other writer can slip in between them.
    async fn owned_update<C: GenericClient + Sync>(
        &self,
        client: &C,
        collection: &str,
        entity_id: &str,
        owner_id: &str,
        update: &Update,
        operation: &'static str,
    ) -> Result<(), DocumentError> {
        let clause = UpdateBuilder::new(unix_now()).build(update)?;
        let (guard, guard_args) = guard_clause(self.owner_field, entity_id, owner_id, clause.next_placeholder)?;

        if !self.ensure_table(client, collection).await? {
            return Err(DocumentError::NotFoundOrUnauthorized);
        }

        let query = format!("UPDATE {} SET {}{}", quote_identifier(collection), clause.set_clause, guard);
        let mut args = clause.args;
        args.extend(guard_args);

        debug!("Postgres({}).{}: {}", collection, operation, query);
        let affected = client.execute(&query, &params(&args)).await.map_err(|err| self.fail(operation, collection, err))?;
        if affected == 0 {
            return Err(DocumentError::NotFoundOrUnauthorized);
        }
        Ok(())
    }
}

/// `WHERE` for rows with this id, owned by `owner_id` and not soft deleted
fn guard_clause(owner_field: &str, entity_id: &str, owner_id: &str, start: usize) -> Result<(String, Vec<PGValue>), DocumentError> {
    let owner = FieldPath::parse(owner_field)?;
    let deleted = FieldPath::parse(DELETED_FIELD)?;

    let mut guard = Sql::new();
    guard.sql(r#" WHERE "object_id" = "#);
    guard.arg(entity_id);
    guard.sql(format!(" AND {} = ", text_path(DATA, &owner)));
    guard.arg(owner_id);
    guard.sql(format!(" AND COALESCE({}, 'false'::jsonb) <> 'true'::jsonb", json_path(DATA, &deleted)));
    Ok(guard.collapse_from(start))
}
