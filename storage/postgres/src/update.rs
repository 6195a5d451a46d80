//! SET clauses for partial updates.
//!
//! Every field operation wraps the previous document expression, so fields
//! the update does not name are carried through untouched. Increments bind
//! the intermediate document once in a sub-select; the statement grows
//! linearly with the number of fields.

use docstore_core::document::LAST_UPDATED_FIELD;
use docstore_core::error::TranslationError;
use docstore_core::filter::FieldPath;
use docstore_core::update::{Increment, Update};
use serde_json::{Map, Value};

use crate::sql_builder::{json_path, path_array, quote_identifier, text_path, Sql, DATA};
use crate::value::PGValue;

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateClause {
    /// `"data" = ..., "last_updated" = $n`
    pub set_clause: String,
    pub args: Vec<PGValue>,
    /// First placeholder number not used by this clause
    pub next_placeholder: usize,
}

#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    source: String,
    timestamp: i64,
    start: usize,
}

impl UpdateBuilder {
    pub fn new(timestamp: i64) -> Self { Self { source: DATA.to_owned(), timestamp, start: 1 } }

    /// The JSON expression the update starts from, e.g. `"doc"."data"` in an upsert.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    pub fn build_replace(&self, fields: &Map<String, Value>) -> Result<UpdateClause, TranslationError> {
        self.build(&Update::from_parts(fields, &Map::new())?)
    }

    pub fn build_increment(&self, fields: &Map<String, Value>) -> Result<UpdateClause, TranslationError> {
        self.build(&Update::from_parts(&Map::new(), fields)?)
    }

    pub fn build_mixed(&self, replace: &Map<String, Value>, increment: &Map<String, Value>) -> Result<UpdateClause, TranslationError> {
        self.build(&Update::from_parts(replace, increment)?)
    }

    pub fn build(&self, update: &Update) -> Result<UpdateClause, TranslationError> {
        if update.is_empty() {
            return Err(TranslationError::EmptyUpdate);
        }

        let mut doc = Sql::new();
        doc.sql(&self.source);

        for (index, (path, value)) in update.replace_fields().iter().enumerate() {
            doc = replace_sql(doc, &format!("set{index}"), path, value);
        }
        for (index, (path, amount)) in update.increment_fields().iter().enumerate() {
            doc = increment_sql(doc, &format!("inc{index}"), path, *amount);
        }

        let mut sql = Sql::new();
        sql.sql(format!("{DATA} = jsonb_set("));
        sql.append(doc);
        sql.sql(format!(", ARRAY['{LAST_UPDATED_FIELD}'], to_jsonb("));
        sql.arg(self.timestamp);
        sql.sql(format!("::bigint), true), {} = ", quote_identifier(LAST_UPDATED_FIELD)));
        sql.arg(self.timestamp);

        let (set_clause, args) = sql.collapse_from(self.start);
        let next_placeholder = self.start + args.len();
        Ok(UpdateClause { set_clause, args, next_placeholder })
    }
}

fn replace_sql(doc: Sql, alias: &str, path: &FieldPath, value: &Value) -> Sql {
    let mut sql = Sql::new();
    if !path.is_nested() {
        sql.sql("jsonb_set(");
        sql.append(doc);
        sql.sql(format!(", {}, ", path_array(path)));
        sql.arg(value.clone());
        sql.sql("::jsonb, true)");
        return sql;
    }

    let bound = format!("{alias}.doc");
    sql.sql(format!("(SELECT jsonb_set({}, {}, ", with_parents(&bound, path), path_array(path)));
    sql.arg(value.clone());
    sql.sql("::jsonb, true) FROM (SELECT ");
    sql.append(doc);
    sql.sql(format!(" AS doc) AS {alias})"));
    sql
}

fn increment_sql(doc: Sql, alias: &str, path: &FieldPath, amount: Increment) -> Sql {
    let bound = format!("{alias}.doc");
    let mut sql = Sql::new();
    sql.sql(format!("(SELECT jsonb_set({}, {}, to_jsonb({} + ", with_parents(&bound, path), path_array(path), previous_number(&bound, path)));
    match amount {
        Increment::Integer(delta) => {
            sql.arg(delta);
            sql.sql("::bigint");
        }
        Increment::Float(delta) => {
            sql.arg(PGValue::Double(delta));
            sql.sql("::double precision");
        }
    }
    sql.sql("), true) FROM (SELECT ");
    sql.append(doc);
    sql.sql(format!(" AS doc) AS {alias})"));
    sql
}

/// The current value read leniently: JSON numbers and numeric looking
/// strings count, anything else is 0.
fn previous_number(doc: &str, path: &FieldPath) -> String {
    let json = json_path(doc, path);
    let text = text_path(doc, path);
    format!(
        r#"CASE jsonb_typeof({json}) WHEN 'number' THEN ({text})::numeric WHEN 'string' THEN CASE WHEN {text} ~ '^\s*-?[0-9]+(\.[0-9]+)?\s*$' THEN trim({text})::numeric ELSE 0 END ELSE 0 END"#
    )
}

/// `doc` with every parent object of `path` present, since `jsonb_set`
/// only creates the last path element.
fn with_parents(doc: &str, path: &FieldPath) -> String {
    let segments = path.segments();
    let mut expr = doc.to_owned();
    for depth in 1..segments.len() {
        let parent = FieldPath::parse(&segments[..depth].join(".")).unwrap_or_else(|_| path.clone());
        let current = json_path(doc, &parent);
        expr = format!(
            "jsonb_set({expr}, {}, CASE WHEN jsonb_typeof({current}) = 'object' THEN {current} ELSE '{{}}'::jsonb END, true)",
            path_array(&parent)
        );
    }
    expr
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn replace_chains_and_stamps() {
        let clause = UpdateBuilder::new(1700).build_replace(&map(json!({"title": "new", "views": 3}))).unwrap();
        assert_eq!(
            clause.set_clause,
            r#""data" = jsonb_set(jsonb_set(jsonb_set("data", ARRAY['title'], $1::jsonb, true), ARRAY['views'], $2::jsonb, true), ARRAY['last_updated'], to_jsonb($3::bigint), true), "last_updated" = $4"#
        );
        assert_eq!(clause.args, vec![PGValue::Jsonb(json!("new")), PGValue::Jsonb(json!(3)), PGValue::BigInt(1700), PGValue::BigInt(1700)]);
        assert_eq!(clause.next_placeholder, 5);
    }

    #[test]
    fn increment_reads_previous_leniently() {
        let clause = UpdateBuilder::new(9).build_increment(&map(json!({"score": 10}))).unwrap();
        assert_eq!(
            clause.set_clause,
            r#""data" = jsonb_set((SELECT jsonb_set(inc0.doc, ARRAY['score'], to_jsonb(CASE jsonb_typeof(inc0.doc->'score') WHEN 'number' THEN (inc0.doc->>'score')::numeric WHEN 'string' THEN CASE WHEN inc0.doc->>'score' ~ '^\s*-?[0-9]+(\.[0-9]+)?\s*$' THEN trim(inc0.doc->>'score')::numeric ELSE 0 END ELSE 0 END + $1::bigint), true) FROM (SELECT "data" AS doc) AS inc0), ARRAY['last_updated'], to_jsonb($2::bigint), true), "last_updated" = $3"#
        );
        assert_eq!(clause.args[0], PGValue::BigInt(10));
    }

    #[test]
    fn mixed_applies_increments_after_replacements() {
        let clause = UpdateBuilder::new(1).start(3).build_mixed(&map(json!({"title": "t"})), &map(json!({"ratio": "0.5"}))).unwrap();
        // placeholders follow the text: the delta is rendered before the document it reads from
        assert!(clause.set_clause.contains("$3::double precision"));
        assert!(clause.set_clause.contains(r#"FROM (SELECT jsonb_set("data", ARRAY['title'], $4::jsonb, true) AS doc) AS inc0"#));
        assert_eq!(clause.args[0], PGValue::Double(0.5));
        assert_eq!(clause.args[1], PGValue::Jsonb(json!("t")));
        assert_eq!(clause.next_placeholder, 7);
    }

    #[test]
    fn nested_replace_creates_parents() {
        let clause = UpdateBuilder::new(1).build_replace(&map(json!({"meta.lang": "de"}))).unwrap();
        assert!(clause.set_clause.starts_with(
            r#""data" = jsonb_set((SELECT jsonb_set(jsonb_set(set0.doc, ARRAY['meta'], CASE WHEN jsonb_typeof(set0.doc->'meta') = 'object' THEN set0.doc->'meta' ELSE '{}'::jsonb END, true), ARRAY['meta','lang'], $1::jsonb, true) FROM (SELECT "data" AS doc) AS set0)"#
        ));
    }

    #[test]
    fn configurable_source() {
        let clause = UpdateBuilder::new(1).source(r#""doc"."data""#).build_replace(&map(json!({"a": 1}))).unwrap();
        assert!(clause.set_clause.starts_with(r#""data" = jsonb_set(jsonb_set("doc"."data", ARRAY['a']"#));
    }

    #[test]
    fn rejects_bad_increments_and_empty_updates() {
        let builder = UpdateBuilder::new(1);
        assert!(matches!(builder.build_increment(&map(json!({"score": "lots"}))), Err(TranslationError::NonNumericIncrement { .. })));
        assert_eq!(builder.build_replace(&Map::new()), Err(TranslationError::EmptyUpdate));
        assert_eq!(builder.build(&Update::new()), Err(TranslationError::EmptyUpdate));
    }

    #[test]
    fn statement_grows_linearly() {
        let fields: Map<String, Value> = (0..20).map(|i| (format!("f{i}"), json!(1))).collect();
        let clause = UpdateBuilder::new(1).build_increment(&fields).unwrap();
        // the source document is mentioned once however many fields there are
        assert_eq!(clause.set_clause.matches(r#"SELECT "data" AS doc"#).count(), 1);
        assert!(clause.set_clause.len() < 20 * 400);
    }
}
