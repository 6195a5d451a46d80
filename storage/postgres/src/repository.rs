//! Statements behind the [`DocumentStore`](docstore_core::DocumentStore)
//! operations, generic over the client so the store and its transactions
//! share them.

use docstore_core::document::{unix_now, CREATED_DATE_FIELD, LAST_UPDATED_FIELD, OBJECT_ID_FIELD};
use docstore_core::error::{DocumentError, TranslationError};
use docstore_core::filter::{FieldPath, Filter};
use docstore_core::query::{Cursor, CursorQuery, FindOptions, IndexInfo, IndexSpec, Page, SortDirection, SortField, UpdateOptions, UpdateResult};
use docstore_core::update::Update;
use serde_json::{Map, Value};
use tokio_postgres::{GenericClient, Row};
use tracing::debug;

use crate::error::{driver_error, error_kind, ErrorKind};
use crate::predicate::{translate, translate_from, Column, Source};
use crate::schema::{self, TableManager};
use crate::sql_builder::{json_path, quote_identifier, Sql, DATA};
use crate::update::UpdateBuilder;
use crate::value::{params, PGValue};
use crate::Postgres;

const DELETE_MANY_SAVEPOINT: &str = "docstore_delete_many";
const UPSERT_ALIAS: &str = "doc";

/// Where statements run. Tables are only created outside read-only
/// transactions, and only cached outside transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Autocommit,
    Transaction { read_only: bool },
}

pub struct Repository<'a> {
    pub(crate) tables: &'a TableManager,
    pub(crate) owner_field: &'a str,
    pub(crate) mode: Mode,
}

impl<'a> Repository<'a> {
    pub fn new(tables: &'a TableManager, owner_field: &'a str, mode: Mode) -> Self { Self { tables, owner_field, mode } }

    /// Map a driver error, forgetting the table when it turned out to be gone.
    pub(crate) fn fail(&self, operation: &'static str, collection: &str, err: tokio_postgres::Error) -> DocumentError {
        if error_kind(&err) == ErrorKind::UndefinedTable {
            self.tables.forget(collection);
        }
        driver_error(operation, collection, err)
    }

    pub async fn ensure_table<C: GenericClient + Sync>(&self, client: &C, collection: &str) -> Result<bool, DocumentError> {
        if !Postgres::sane_name(collection) {
            return Err(DocumentError::InvalidCollectionName(collection.to_owned()));
        }
        self.tables.ensure(client, collection, self.mode).await
    }

    pub async fn save<C: GenericClient + Sync>(&self, client: &C, collection: &str, body: Map<String, Value>) -> Result<i64, DocumentError> {
        let ids = self.save_many(client, collection, vec![body]).await?;
        ids.into_iter().next().ok_or_else(|| DocumentError::InvalidDocument("insert returned no id".into()))
    }

    /// One multi-row insert. Ids are returned in the order of `bodies`.
    pub async fn save_many<C: GenericClient + Sync>(&self, client: &C, collection: &str, bodies: Vec<Map<String, Value>>) -> Result<Vec<i64>, DocumentError> {
        if bodies.is_empty() {
            return Ok(Vec::new());
        }
        let operation = if bodies.len() == 1 { "save" } else { "save_many" };

        let mut sql = Sql::new();
        sql.sql(format!(
            r#"INSERT INTO {} ("object_id", "data", "created_date", "last_updated") VALUES "#,
            quote_identifier(collection)
        ));
        let mut object_ids = Vec::with_capacity(bodies.len());
        for (index, body) in bodies.into_iter().enumerate() {
            let (object_id, created_date, last_updated) = mirrored(&body)?;
            if index > 0 {
                sql.sql(", ");
            }
            sql.sql("(");
            sql.arg(object_id.clone());
            sql.sql(", ");
            sql.arg(Value::Object(body));
            sql.sql(", ");
            sql.arg(created_date);
            sql.sql(", ");
            sql.arg(last_updated);
            sql.sql(")");
            object_ids.push(object_id);
        }
        sql.sql(r#" RETURNING "id", "object_id""#);

        self.ensure_table(client, collection).await?;
        let (query, args) = sql.collapse();
        debug!("Postgres({}).{}: {} rows", collection, operation, object_ids.len());
        let rows = client.query(&query, &params(&args)).await.map_err(|err| self.fail(operation, collection, err))?;

        let mut inserted = std::collections::HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get(0).map_err(|err| driver_error(operation, collection, err))?;
            let object_id: String = row.try_get(1).map_err(|err| driver_error(operation, collection, err))?;
            inserted.insert(object_id, id);
        }
        object_ids
            .iter()
            .map(|object_id| inserted.get(object_id).copied().ok_or_else(|| DocumentError::InvalidDocument(format!("no id returned for {object_id}"))))
            .collect()
    }

    pub async fn find<C: GenericClient + Sync>(&self, client: &C, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>, DocumentError> {
        let (predicate, mut args) = translate(filter, 1)?;
        if !self.ensure_table(client, collection).await? {
            return Ok(Vec::new());
        }

        let mut query = format!("SELECT {DATA} FROM {}{}{}", quote_identifier(collection), where_clause(&predicate), order_by(&options.sort));
        if let Some(limit) = options.limit {
            args.push(PGValue::BigInt(clamp(limit)));
            query += &format!(" LIMIT ${}", args.len());
        }
        if let Some(skip) = options.skip {
            args.push(PGValue::BigInt(clamp(skip)));
            query += &format!(" OFFSET ${}", args.len());
        }

        debug!("Postgres({}).find: {}", collection, query);
        let rows = match client.query(&query, &params(&args)).await {
            Ok(rows) => rows,
            // inside a transaction the failed statement has already aborted it
            Err(err) if self.mode == Mode::Autocommit && error_kind(&err) == ErrorKind::UndefinedTable => {
                self.tables.forget(collection);
                return Ok(Vec::new());
            }
            Err(err) => return Err(self.fail("find", collection, err)),
        };
        rows.iter().map(|row| row.try_get(0).map_err(|err| driver_error("find", collection, err))).collect()
    }

    pub async fn find_one<C: GenericClient + Sync>(&self, client: &C, collection: &str, filter: &Filter) -> Result<Value, DocumentError> {
        let options = FindOptions::new().limit(1);
        self.find(client, collection, filter, &options).await?.into_iter().next().ok_or(DocumentError::NoDocuments)
    }

    pub async fn count<C: GenericClient + Sync>(&self, client: &C, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let (predicate, args) = translate(filter, 1)?;
        if !self.ensure_table(client, collection).await? {
            return Ok(0);
        }

        let query = format!("SELECT COUNT(*) FROM {}{}", quote_identifier(collection), where_clause(&predicate));
        debug!("Postgres({}).count: {}", collection, query);
        let row = client.query_one(&query, &params(&args)).await.map_err(|err| self.fail("count", collection, err))?;
        let count: i64 = row.try_get(0).map_err(|err| driver_error("count", collection, err))?;
        Ok(count.max(0) as u64)
    }

    pub async fn distinct<C: GenericClient + Sync>(&self, client: &C, collection: &str, field: &str, filter: &Filter) -> Result<Vec<Value>, DocumentError> {
        let path = FieldPath::parse(field)?;
        let (predicate, args) = translate(filter, 1)?;
        if !self.ensure_table(client, collection).await? {
            return Ok(Vec::new());
        }

        let value = match Column::of(&path) {
            Some(column) => format!("to_jsonb({})", column.identifier()),
            None => json_path(DATA, &path),
        };
        let mut conditions = format!("{value} IS NOT NULL");
        if !predicate.is_empty() {
            conditions = format!("{conditions} AND ({predicate})");
        }
        let query = format!(r#"SELECT DISTINCT {value} AS "value" FROM {} WHERE {conditions} ORDER BY 1"#, quote_identifier(collection));
        debug!("Postgres({}).distinct: {}", collection, query);
        let rows = client.query(&query, &params(&args)).await.map_err(|err| self.fail("distinct", collection, err))?;
        rows.iter().map(|row| row.try_get(0).map_err(|err| driver_error("distinct", collection, err))).collect()
    }

    /// Update the first match (`multi == false`) or every match. Update
    /// arguments come first, filter arguments continue the numbering.
    pub async fn update<C: GenericClient + Sync>(
        &self,
        client: &C,
        collection: &str,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
        multi: bool,
    ) -> Result<UpdateResult, DocumentError> {
        if options.upsert {
            return self.upsert(client, collection, filter, update).await;
        }
        let operation = if multi { "update_many" } else { "update" };

        let clause = UpdateBuilder::new(unix_now()).build(update)?;
        let (predicate, filter_args) = translate(filter, clause.next_placeholder)?;
        if !self.ensure_table(client, collection).await? {
            return Ok(UpdateResult::default());
        }

        let table = quote_identifier(collection);
        let query = if multi {
            format!("UPDATE {table} SET {}{}", clause.set_clause, where_clause(&predicate))
        } else {
            format!("UPDATE {table} SET {} WHERE {}", clause.set_clause, first_match(&table, &predicate))
        };
        let mut args = clause.args;
        args.extend(filter_args);

        debug!("Postgres({}).{}: {}", collection, operation, query);
        let affected = client.execute(&query, &params(&args)).await.map_err(|err| self.fail(operation, collection, err))?;
        Ok(UpdateResult { matched_count: affected, modified_count: affected, upserted_id: None })
    }

    /// Insert the document the filter describes, or update it when its
    /// `object_id` already exists and the rest of the filter matches.
    async fn upsert<C: GenericClient + Sync>(&self, client: &C, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult, DocumentError> {
        let Some(object_id) = filter.object_id() else {
            return Err(TranslationError::InvalidOperand {
                field: OBJECT_ID_FIELD.to_owned(),
                operator: "upsert".to_owned(),
                expected: "an object_id equality in the filter",
            }
            .into());
        };

        let now = unix_now();
        let clause = UpdateBuilder::new(now).source(format!("{}.{DATA}", quote_identifier(UPSERT_ALIAS))).build(update)?;
        let seed = seed_document(filter, update, object_id, now);

        let mut insert = Sql::new();
        insert.sql("(");
        insert.arg(object_id);
        insert.sql(", ");
        insert.arg(Value::Object(seed));
        insert.sql(", ");
        insert.arg(now);
        insert.sql(", ");
        insert.arg(now);
        insert.sql(")");
        let (values, insert_args) = insert.collapse_from(clause.next_placeholder);
        let (predicate, filter_args) = translate_from(filter, clause.next_placeholder + insert_args.len(), Source::aliased(UPSERT_ALIAS))?;
        self.ensure_table(client, collection).await?;

        let alias = quote_identifier(UPSERT_ALIAS);
        let query = format!(
            r#"INSERT INTO {} AS {alias} ("object_id", "data", "created_date", "last_updated") VALUES {values} ON CONFLICT ("object_id") DO UPDATE SET {}{} RETURNING {alias}."id", ({alias}.xmax = 0) AS "inserted""#,
            quote_identifier(collection),
            clause.set_clause,
            where_clause(&predicate),
        );
        let mut args = clause.args;
        args.extend(insert_args);
        args.extend(filter_args);

        debug!("Postgres({}).upsert: {}", collection, query);
        let row = client.query_opt(&query, &params(&args)).await.map_err(|err| self.fail("upsert", collection, err))?;
        let Some(row) = row else {
            // the object_id exists but the rest of the filter does not match
            return Ok(UpdateResult::default());
        };
        let id: i64 = row.try_get(0).map_err(|err| driver_error("upsert", collection, err))?;
        let inserted: bool = row.try_get(1).map_err(|err| driver_error("upsert", collection, err))?;
        Ok(if inserted {
            UpdateResult { matched_count: 0, modified_count: 0, upserted_id: Some(id) }
        } else {
            UpdateResult { matched_count: 1, modified_count: 1, upserted_id: None }
        })
    }

    /// Delete the first match.
    pub async fn delete<C: GenericClient + Sync>(&self, client: &C, collection: &str, filter: &Filter) -> Result<u64, DocumentError> {
        let (predicate, args) = translate(filter, 1)?;
        if !self.ensure_table(client, collection).await? {
            return Ok(0);
        }

        let table = quote_identifier(collection);
        let query = format!("DELETE FROM {table} WHERE {}", first_match(&table, &predicate));
        debug!("Postgres({}).delete: {}", collection, query);
        client.execute(&query, &params(&args)).await.map_err(|err| self.fail("delete", collection, err))
    }

    /// One DELETE per filter, all or nothing: its own transaction in
    /// autocommit mode, a savepoint inside a caller's transaction.
    pub async fn delete_many<C: GenericClient + Sync + Send>(&self, client: &mut C, collection: &str, filters: &[Filter]) -> Result<u64, DocumentError> {
        let table = quote_identifier(collection);
        let statements = filters
            .iter()
            .map(|filter| {
                let (predicate, args) = translate(filter, 1)?;
                Ok((format!("DELETE FROM {table}{}", where_clause(&predicate)), args))
            })
            .collect::<Result<Vec<_>, DocumentError>>()?;
        if statements.is_empty() || !self.ensure_table(&*client, collection).await? {
            return Ok(0);
        }

        match self.mode {
            Mode::Autocommit => {
                let transaction = client.transaction().await.map_err(|err| self.fail("delete_many", collection, err))?;
                match self.delete_each(&transaction, collection, &statements).await {
                    Ok(deleted) => {
                        transaction.commit().await.map_err(|err| self.fail("delete_many", collection, err))?;
                        Ok(deleted)
                    }
                    Err(err) => {
                        // a failed rollback leaves nothing to report beyond the original error
                        let _ = transaction.rollback().await;
                        Err(err)
                    }
                }
            }
            Mode::Transaction { .. } => {
                let client = &*client;
                client.batch_execute(&format!("SAVEPOINT {DELETE_MANY_SAVEPOINT}")).await.map_err(|err| self.fail("delete_many", collection, err))?;
                match self.delete_each(client, collection, &statements).await {
                    Ok(deleted) => {
                        client
                            .batch_execute(&format!("RELEASE SAVEPOINT {DELETE_MANY_SAVEPOINT}"))
                            .await
                            .map_err(|err| self.fail("delete_many", collection, err))?;
                        Ok(deleted)
                    }
                    Err(err) => {
                        client
                            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {DELETE_MANY_SAVEPOINT}; RELEASE SAVEPOINT {DELETE_MANY_SAVEPOINT}"))
                            .await
                            .map_err(|err| self.fail("delete_many", collection, err))?;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn delete_each<C: GenericClient + Sync>(&self, client: &C, collection: &str, statements: &[(String, Vec<PGValue>)]) -> Result<u64, DocumentError> {
        let mut deleted = 0;
        for (query, args) in statements {
            debug!("Postgres({}).delete_many: {}", collection, query);
            deleted += client.execute(query, &params(args)).await.map_err(|err| self.fail("delete_many", collection, err))?;
        }
        Ok(deleted)
    }

    /// Keyset pagination: rows after the cursor position in `(sort value, id)`
    /// order, one extra row fetched to tell whether another page exists.
    pub async fn find_with_cursor<C: GenericClient + Sync>(
        &self,
        client: &C,
        collection: &str,
        filter: &Filter,
        query: &CursorQuery,
    ) -> Result<Page<Value>, DocumentError> {
        let sort = &query.sort;
        let limit = query.page_size();
        let after = query.cursor.as_deref().map(|token| Cursor::decode_for(token, sort)).transpose()?;
        let key = SortKey::new(&sort.path);

        let (predicate, mut args) = translate(filter, 1)?;
        let mut conditions = Vec::new();
        if !predicate.is_empty() {
            conditions.push(format!("({predicate})"));
        }
        if let Some(after) = &after {
            let (value, cast) = key.arg(&after.value)?;
            args.push(value);
            args.push(PGValue::BigInt(after.id));
            let comparison = match sort.direction {
                SortDirection::Ascending => ">",
                SortDirection::Descending => "<",
            };
            conditions.push(format!(r#"({}, "id") {comparison} (${}{cast}, ${})"#, key.order, args.len() - 1, args.len()));
        }
        args.push(PGValue::BigInt(clamp(limit.saturating_add(1))));

        if !self.ensure_table(client, collection).await? {
            return Ok(Page { items: Vec::new(), next_cursor: None, has_more: false });
        }

        let direction = direction_sql(sort.direction);
        let where_sql = if conditions.is_empty() { String::new() } else { format!(" WHERE {}", conditions.join(" AND ")) };
        let sql = format!(
            r#"SELECT "id", {DATA}, {} AS "cursor_value" FROM {}{where_sql} ORDER BY {} {direction}, "id" {direction} LIMIT ${}"#,
            key.value,
            quote_identifier(collection),
            key.order,
            args.len()
        );
        debug!("Postgres({}).find_with_cursor: {}", collection, sql);
        let mut rows = client.query(&sql, &params(&args)).await.map_err(|err| self.fail("find_with_cursor", collection, err))?;

        let has_more = rows.len() as u64 > limit;
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        let next_cursor = match rows.last() {
            Some(last) if has_more => Some(cursor_after(last, sort, collection)?.encode()?),
            _ => None,
        };
        let items = rows.iter().map(|row| row.try_get(1).map_err(|err| driver_error("find_with_cursor", collection, err))).collect::<Result<_, _>>()?;
        Ok(Page { items, next_cursor, has_more })
    }

    pub async fn create_index<C: GenericClient + Sync>(&self, client: &C, collection: &str, index: &IndexSpec) -> Result<String, DocumentError> {
        self.ensure_table(client, collection).await?;
        schema::create_index(client, collection, index, self.mode).await
    }

    pub async fn drop_index<C: GenericClient + Sync>(&self, client: &C, collection: &str, name: &str) -> Result<(), DocumentError> {
        if !Postgres::sane_name(collection) {
            return Err(DocumentError::InvalidCollectionName(collection.to_owned()));
        }
        schema::drop_index(client, collection, name, self.mode).await
    }

    pub async fn list_indexes<C: GenericClient + Sync>(&self, client: &C, collection: &str) -> Result<Vec<IndexInfo>, DocumentError> {
        if !Postgres::sane_name(collection) {
            return Err(DocumentError::InvalidCollectionName(collection.to_owned()));
        }
        schema::list_indexes(client, collection).await
    }
}

/// The expression a cursor sorts on. Mirrored fields use their typed
/// column; anything else the JSON value, with missing fields as JSON null
/// so every row has a comparable key.
struct SortKey {
    column: Option<Column>,
    field: String,
    order: String,
    value: String,
}

impl SortKey {
    fn new(path: &FieldPath) -> Self {
        match Column::of(path) {
            Some(column) => Self { column: Some(column), field: path.to_string(), order: column.identifier(), value: format!("to_jsonb({})", column.identifier()) },
            None => {
                let json = format!("COALESCE({}, 'null'::jsonb)", json_path(DATA, path));
                Self { column: None, field: path.to_string(), order: json.clone(), value: json }
            }
        }
    }

    fn arg(&self, value: &Value) -> Result<(PGValue, &'static str), DocumentError> {
        match self.column {
            Some(column) => column.arg(&self.field, "cursor", value).map_err(|err| DocumentError::InvalidCursor(err.to_string())),
            None => Ok((PGValue::Jsonb(value.clone()), "::jsonb")),
        }
    }
}

fn cursor_after(row: &Row, sort: &SortField, collection: &str) -> Result<Cursor, DocumentError> {
    Ok(Cursor {
        field: sort.path.to_string(),
        direction: sort.direction,
        value: row.try_get("cursor_value").map_err(|err| driver_error("find_with_cursor", collection, err))?,
        id: row.try_get("id").map_err(|err| driver_error("find_with_cursor", collection, err))?,
    })
}

/// Identity and timestamps as stored in their columns.
fn mirrored(body: &Map<String, Value>) -> Result<(String, i64, i64), DocumentError> {
    let object_id = body.get(OBJECT_ID_FIELD).and_then(Value::as_str).filter(|id| !id.is_empty());
    let Some(object_id) = object_id else {
        return Err(DocumentError::InvalidDocument("object_id must be a non-empty string".into()));
    };
    let timestamp = |field| body.get(field).and_then(Value::as_i64).unwrap_or(0);
    Ok((object_id.to_owned(), timestamp(CREATED_DATE_FIELD), timestamp(LAST_UPDATED_FIELD)))
}

/// The document an upsert inserts: the filter's equalities, then the
/// replaced fields, then the increments applied to nothing.
fn seed_document(filter: &Filter, update: &Update, object_id: &str, now: i64) -> Map<String, Value> {
    let mut doc = Map::new();
    for (path, value) in filter.equalities() {
        if Column::of(path).is_none() {
            set_path(&mut doc, path, value.clone());
        }
    }
    for (path, value) in update.replace_fields() {
        set_path(&mut doc, path, value.clone());
    }
    for (path, amount) in update.increment_fields() {
        set_path(&mut doc, path, Value::from(*amount));
    }
    doc.insert(OBJECT_ID_FIELD.to_owned(), Value::from(object_id));
    doc.insert(CREATED_DATE_FIELD.to_owned(), Value::from(now));
    doc.insert(LAST_UPDATED_FIELD.to_owned(), Value::from(now));
    doc
}

fn set_path(doc: &mut Map<String, Value>, path: &FieldPath, value: Value) {
    let segments = path.segments();
    let Some((last, parents)) = segments.split_last() else { return };
    let mut current = doc;
    for segment in parents {
        let entry = current.entry(segment.clone()).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else { return };
        current = next;
    }
    current.insert(last.clone(), value);
}

fn where_clause(predicate: &str) -> String {
    if predicate.is_empty() {
        String::new()
    } else {
        format!(" WHERE {predicate}")
    }
}

/// Restricts a statement to the earliest inserted matching row.
fn first_match(table: &str, predicate: &str) -> String {
    format!(r#""id" = (SELECT "id" FROM {table}{} ORDER BY "id" LIMIT 1 FOR UPDATE)"#, where_clause(predicate))
}

fn order_by(sort: &[SortField]) -> String {
    let mut items: Vec<String> = sort
        .iter()
        .map(|field| {
            let expr = match Column::of(&field.path) {
                Some(column) => column.identifier(),
                None => json_path(DATA, &field.path),
            };
            format!("{expr} {}", direction_sql(field.direction))
        })
        .collect();
    items.push(r#""id" ASC"#.to_owned());
    format!(" ORDER BY {}", items.join(", "))
}

fn direction_sql(direction: SortDirection) -> &'static str {
    match direction {
        SortDirection::Ascending => "ASC",
        SortDirection::Descending => "DESC",
    }
}

fn clamp(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_break_ties_by_insertion_order() {
        let sort = vec![SortField::descending("score").unwrap(), SortField::ascending("created_date").unwrap()];
        assert_eq!(order_by(&sort), r#" ORDER BY "data"->'score' DESC, "created_date" ASC, "id" ASC"#);
        assert_eq!(order_by(&[]), r#" ORDER BY "id" ASC"#);
    }

    #[test]
    fn first_match_pins_one_row() {
        assert_eq!(
            first_match(r#""posts""#, r#""data"->>'a' = $3"#),
            r#""id" = (SELECT "id" FROM "posts" WHERE "data"->>'a' = $3 ORDER BY "id" LIMIT 1 FOR UPDATE)"#
        );
    }

    #[test]
    fn upsert_seed_combines_filter_and_update() {
        let filter = Filter::parse(&json!({"object_id": "p1", "meta.lang": "de", "views": {"$gt": 3}})).unwrap();
        let update = Update::parse(&json!({"$set": {"title": "t"}, "$inc": {"views": 2}})).unwrap();
        let seed = seed_document(&filter, &update, "p1", 100);
        assert_eq!(
            Value::Object(seed),
            json!({"meta": {"lang": "de"}, "title": "t", "views": 2, "object_id": "p1", "created_date": 100, "last_updated": 100})
        );
    }

    #[test]
    fn mirrored_fields_need_an_object_id() {
        let body = match json!({"object_id": "a", "created_date": 5}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(mirrored(&body).unwrap(), ("a".to_owned(), 5, 0));
        assert!(matches!(mirrored(&Map::new()), Err(DocumentError::InvalidDocument(_))));
    }

    #[test]
    fn cursor_keys_follow_the_column() {
        let key = SortKey::new(&FieldPath::parse("created_date").unwrap());
        assert_eq!(key.order, r#""created_date""#);
        assert_eq!(key.arg(&json!(10)).unwrap(), (PGValue::BigInt(10), "::bigint"));
        assert!(matches!(key.arg(&json!("x")), Err(DocumentError::InvalidCursor(_))));

        let key = SortKey::new(&FieldPath::parse("score").unwrap());
        assert_eq!(key.order, r#"COALESCE("data"->'score', 'null'::jsonb)"#);
        assert_eq!(key.arg(&json!(null)).unwrap(), (PGValue::Jsonb(json!(null)), "::jsonb"));
    }
}
