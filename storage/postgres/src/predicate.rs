//! Filter translation.
//!
//! Renders a [`Filter`] as a WHERE predicate over the collection table.
//! Values are always bound as arguments; field names only ever appear as
//! escaped string literals inside JSON accessors.

use docstore_core::document::{CREATED_DATE_FIELD, LAST_UPDATED_FIELD, OBJECT_ID_FIELD};
use docstore_core::error::TranslationError;
use docstore_core::filter::{Clause, ComparisonOperator, Condition, FieldPath, Filter};
use serde_json::{Number, Value};

use crate::sql_builder::{json_path, quote_identifier, text_path, Sql, DATA};
use crate::value::PGValue;

/// Translate `filter` with placeholders numbered from `start`. The empty
/// filter yields an empty predicate and no arguments.
pub fn translate(filter: &Filter, start: usize) -> Result<(String, Vec<PGValue>), TranslationError> {
    translate_from(filter, start, Source::default())
}

/// Translate against an aliased table, as in the conflict branch of an upsert.
pub fn translate_from(filter: &Filter, start: usize, source: Source) -> Result<(String, Vec<PGValue>), TranslationError> {
    Ok(filter_sql(filter, source)?.collapse_from(start))
}

/// Where the predicate reads the document from
#[derive(Debug, Clone, Copy, Default)]
pub struct Source<'a> {
    alias: Option<&'a str>,
}

impl<'a> Source<'a> {
    pub fn aliased(alias: &'a str) -> Self { Self { alias: Some(alias) } }

    pub fn data(&self) -> String { self.qualify(DATA) }

    pub fn column(&self, column: Column) -> String { self.qualify(&column.identifier()) }

    fn qualify(&self, identifier: &str) -> String {
        match self.alias {
            Some(alias) => format!("{}.{}", quote_identifier(alias), identifier),
            None => identifier.to_owned(),
        }
    }
}

/// Fields mirrored into their own typed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    ObjectId,
    CreatedDate,
    LastUpdated,
}

impl Column {
    pub fn of(path: &FieldPath) -> Option<Self> {
        match path.simple()? {
            OBJECT_ID_FIELD => Some(Column::ObjectId),
            CREATED_DATE_FIELD => Some(Column::CreatedDate),
            LAST_UPDATED_FIELD => Some(Column::LastUpdated),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Column::ObjectId => OBJECT_ID_FIELD,
            Column::CreatedDate => CREATED_DATE_FIELD,
            Column::LastUpdated => LAST_UPDATED_FIELD,
        }
    }

    pub fn identifier(&self) -> String { quote_identifier(self.name()) }

    /// Convert a JSON value to the column's native type, with the cast the
    /// placeholder needs.
    pub fn arg(&self, field: &str, operator: &str, value: &Value) -> Result<(PGValue, &'static str), TranslationError> {
        let invalid = |expected| TranslationError::InvalidOperand { field: field.to_owned(), operator: operator.to_owned(), expected };
        match self {
            Column::ObjectId => match value {
                Value::String(text) => Ok((PGValue::Text(text.clone()), "")),
                _ => Err(invalid("a string")),
            },
            Column::CreatedDate | Column::LastUpdated => match value {
                Value::Number(number) => Ok(number_arg(number)),
                _ => Err(invalid("a number")),
            },
        }
    }

    fn array_arg(&self, field: &str, operator: &str, values: &[Value]) -> Result<PGValue, TranslationError> {
        let invalid = |expected| TranslationError::InvalidOperand { field: field.to_owned(), operator: operator.to_owned(), expected };
        match self {
            Column::ObjectId => {
                values.iter().map(|value| value.as_str().map(str::to_owned)).collect::<Option<Vec<_>>>().map(PGValue::TextArray).ok_or_else(|| invalid("an array of strings"))
            }
            Column::CreatedDate | Column::LastUpdated => {
                values.iter().map(Value::as_i64).collect::<Option<Vec<_>>>().map(PGValue::BigIntArray).ok_or_else(|| invalid("an array of integers"))
            }
        }
    }
}

fn number_arg(number: &Number) -> (PGValue, &'static str) {
    match number.as_i64() {
        Some(integer) => (PGValue::BigInt(integer), "::bigint"),
        None => (PGValue::Double(number.as_f64().unwrap_or(f64::NAN)), "::double precision"),
    }
}

fn comparison_sql(operator: ComparisonOperator) -> &'static str {
    match operator {
        ComparisonOperator::GreaterThan => ">",
        ComparisonOperator::GreaterThanOrEqual => ">=",
        ComparisonOperator::LessThan => "<",
        ComparisonOperator::LessThanOrEqual => "<=",
        ComparisonOperator::NotEqual => "<>",
    }
}

fn filter_sql(filter: &Filter, source: Source) -> Result<Sql, TranslationError> {
    let mut sql = Sql::new();
    for clause in filter.clauses() {
        let Some(clause) = clause_sql(clause, source)? else { continue };
        if !sql.is_empty() {
            sql.sql(" AND ");
        }
        sql.append(clause);
    }
    Ok(sql)
}

fn clause_sql(clause: &Clause, source: Source) -> Result<Option<Sql>, TranslationError> {
    match clause {
        Clause::Field { path, condition } => match Column::of(path) {
            Some(column) => column_sql(&source.column(column), column, path, condition).map(Some),
            None => field_sql(&source.data(), path, condition).map(Some),
        },
        Clause::Or(members) => group_sql(members, " OR ", source),
        Clause::And(members) => group_sql(members, " AND ", source),
    }
}

/// One parenthesized group. An empty group adds no constraint and an empty
/// member matches everything.
fn group_sql(members: &[Filter], joiner: &str, source: Source) -> Result<Option<Sql>, TranslationError> {
    if members.is_empty() {
        return Ok(None);
    }
    let mut sql = Sql::new();
    sql.sql("(");
    for (index, member) in members.iter().enumerate() {
        if index > 0 {
            sql.sql(joiner);
        }
        let inner = filter_sql(member, source)?;
        if inner.is_empty() {
            sql.sql("TRUE");
        } else if member.clauses().len() > 1 {
            sql.sql("(");
            sql.append(inner);
            sql.sql(")");
        } else {
            sql.append(inner);
        }
    }
    sql.sql(")");
    Ok(Some(sql))
}

fn column_sql(col: &str, column: Column, path: &FieldPath, condition: &Condition) -> Result<Sql, TranslationError> {
    let field = path.to_string();
    let mut sql = Sql::new();

    match condition {
        Condition::Equal(Value::Null) => sql.sql(format!("{col} IS NULL")),
        Condition::Equal(value) => {
            let (arg, cast) = column.arg(&field, "$eq", value)?;
            sql.sql(format!("{col} = "));
            sql.arg(arg);
            sql.sql(cast);
        }
        Condition::Comparison { operator: ComparisonOperator::NotEqual, value: Value::Null } => sql.sql(format!("{col} IS NOT NULL")),
        Condition::Comparison { operator, value } => {
            let (arg, cast) = column.arg(&field, operator.key(), value)?;
            match operator {
                ComparisonOperator::NotEqual => sql.sql(format!("{col} IS DISTINCT FROM ")),
                operator => sql.sql(format!("{col} {} ", comparison_sql(*operator))),
            }
            sql.arg(arg);
            sql.sql(cast);
        }
        Condition::In(values) if values.is_empty() => sql.sql("FALSE"),
        Condition::In(values) => {
            sql.sql(format!("{col} = ANY("));
            sql.arg(column.array_arg(&field, "$in", values)?);
            sql.sql(")");
        }
        Condition::NotIn(values) if values.is_empty() => sql.sql("TRUE"),
        Condition::NotIn(values) => {
            sql.sql(format!("NOT ({col} = ANY("));
            sql.arg(column.array_arg(&field, "$nin", values)?);
            sql.sql("))");
        }
        Condition::All(values) if values.is_empty() => sql.sql("FALSE"),
        Condition::All(values) => {
            sql.sql(format!("{col} = ALL("));
            sql.arg(column.array_arg(&field, "$all", values)?);
            sql.sql(")");
        }
        Condition::Regex { pattern, case_insensitive } => {
            let text = match column {
                Column::ObjectId => col.to_owned(),
                _ => format!("{col}::text"),
            };
            sql.sql(format!("{text} {} ", if *case_insensitive { "~*" } else { "~" }));
            sql.arg(pattern.as_str());
        }
        Condition::Exists(exists) => sql.sql(if *exists { "TRUE" } else { "FALSE" }),
    }
    Ok(sql)
}

/// A comparison that only applies when the JSON value has the given type,
/// so casting never fails on documents that store something else.
fn typed_comparison(sql: &mut Sql, json: &str, json_type: &str, left: &str, operator: &str, arg: PGValue, cast: &str) {
    sql.sql(format!("CASE WHEN jsonb_typeof({json}) = '{json_type}' THEN {left} {operator} "));
    sql.arg(arg);
    sql.sql(format!("{cast} ELSE FALSE END"));
}

fn field_sql(data: &str, path: &FieldPath, condition: &Condition) -> Result<Sql, TranslationError> {
    let json = json_path(data, path);
    let text = text_path(data, path);
    let mut sql = Sql::new();

    match condition {
        Condition::Equal(value) => equal_sql(&mut sql, &json, &text, value),
        Condition::Comparison { operator: ComparisonOperator::NotEqual, value: Value::Null } => {
            sql.sql(format!("({json} IS NOT NULL AND {json} <> 'null'::jsonb)"));
        }
        Condition::Comparison { operator: ComparisonOperator::NotEqual, value } => {
            sql.sql(format!("{json} IS DISTINCT FROM "));
            sql.arg(value.clone());
            sql.sql("::jsonb");
        }
        Condition::Comparison { operator, value } => {
            let operator = comparison_sql(*operator);
            match value {
                Value::String(string) => typed_comparison(&mut sql, &json, "string", &text, operator, PGValue::Text(string.clone()), ""),
                Value::Number(number) => {
                    let (arg, cast) = number_arg(number);
                    typed_comparison(&mut sql, &json, "number", &format!("({text})::numeric"), operator, arg, cast)
                }
                Value::Bool(flag) => {
                    typed_comparison(&mut sql, &json, "boolean", &format!("({text})::boolean"), operator, PGValue::Boolean(*flag), "::boolean")
                }
                // rejected by the filter parser
                _ => {
                    return Err(TranslationError::InvalidOperand {
                        field: path.to_string(),
                        operator: ">".to_owned(),
                        expected: "a non-null scalar",
                    })
                }
            }
        }
        Condition::In(values) if values.is_empty() => sql.sql("FALSE"),
        Condition::In(values) => in_sql(&mut sql, &json, values),
        Condition::NotIn(values) if values.is_empty() => sql.sql("TRUE"),
        Condition::NotIn(values) => {
            sql.sql("NOT COALESCE(");
            in_sql(&mut sql, &json, values);
            sql.sql(", FALSE)");
        }
        Condition::All(values) if values.is_empty() => sql.sql("FALSE"),
        Condition::All(values) => {
            sql.sql(format!("{json} @> "));
            sql.arg(Value::Array(values.clone()));
            sql.sql("::jsonb");
        }
        Condition::Regex { pattern, case_insensitive } => {
            sql.sql(format!("{text} {} ", if *case_insensitive { "~*" } else { "~" }));
            sql.arg(pattern.as_str());
        }
        Condition::Exists(true) => sql.sql(format!("{json} IS NOT NULL")),
        Condition::Exists(false) => sql.sql(format!("{json} IS NULL")),
    }
    Ok(sql)
}

fn equal_sql(sql: &mut Sql, json: &str, text: &str, value: &Value) {
    match value {
        Value::Null => sql.sql(format!("({json} IS NULL OR {json} = 'null'::jsonb)")),
        Value::String(string) => {
            sql.sql(format!("{text} = "));
            sql.arg(string.as_str());
        }
        Value::Bool(flag) => typed_comparison(sql, json, "boolean", &format!("({text})::boolean"), "=", PGValue::Boolean(*flag), "::boolean"),
        Value::Number(number) => {
            let (arg, cast) = number_arg(number);
            typed_comparison(sql, json, "number", &format!("({text})::numeric"), "=", arg, cast)
        }
        Value::Array(_) | Value::Object(_) => {
            sql.sql(format!("{json} = "));
            sql.arg(value.clone());
            sql.sql("::jsonb");
        }
    }
}

/// The field, as an array or a scalar, shares an element with `values`.
/// A null in the set also matches a missing or null field.
fn in_sql(sql: &mut Sql, json: &str, values: &[Value]) {
    let matches_null = values.iter().any(Value::is_null);
    let values: Vec<&Value> = values.iter().filter(|value| !value.is_null()).collect();

    if matches_null {
        sql.sql(format!("({json} IS NULL OR {json} = 'null'::jsonb"));
        if values.is_empty() {
            sql.sql(")");
            return;
        }
        sql.sql(" OR ");
    }

    // containment, not key existence: `?|` would also match object keys
    sql.sql(format!("{json} @> ANY("));
    sql.arg(PGValue::JsonbArray(values.into_iter().cloned().collect()));
    sql.sql("::jsonb[])");

    if matches_null {
        sql.sql(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(filter: Value, start: usize) -> (String, Vec<PGValue>) { translate(&Filter::parse(&filter).unwrap(), start).unwrap() }

    #[test]
    fn empty_filter_is_empty_predicate() {
        assert_eq!(render(json!({}), 1), (String::new(), vec![]));
    }

    #[test]
    fn string_equality() {
        let (sql, args) = render(json!({"title": "hello"}), 1);
        assert_eq!(sql, r#""data"->>'title' = $1"#);
        assert_eq!(args, vec![PGValue::Text("hello".into())]);
    }

    #[test]
    fn nested_path_equality() {
        let (sql, _) = render(json!({"author.address.city": "Berlin"}), 1);
        assert_eq!(sql, r#""data"->'author'->'address'->>'city' = $1"#);
    }

    #[test]
    fn mirrored_columns_compare_natively() {
        let (sql, args) = render(json!({"object_id": "p1", "created_date": {"$gte": 100}}), 1);
        assert_eq!(sql, r#""object_id" = $1 AND "created_date" >= $2::bigint"#);
        assert_eq!(args, vec![PGValue::Text("p1".into()), PGValue::BigInt(100)]);

        let (sql, args) = render(json!({"object_id": {"$in": ["a", "b"]}}), 1);
        assert_eq!(sql, r#""object_id" = ANY($1)"#);
        assert_eq!(args, vec![PGValue::TextArray(vec!["a".into(), "b".into()])]);
    }

    #[test]
    fn numbers_and_booleans_are_cast() {
        let (sql, args) = render(json!({"score": {"$gt": 10}, "published": true}), 3);
        assert_eq!(
            sql,
            r#"CASE WHEN jsonb_typeof("data"->'score') = 'number' THEN ("data"->>'score')::numeric > $3::bigint ELSE FALSE END AND CASE WHEN jsonb_typeof("data"->'published') = 'boolean' THEN ("data"->>'published')::boolean = $4::boolean ELSE FALSE END"#
        );
        assert_eq!(args, vec![PGValue::BigInt(10), PGValue::Boolean(true)]);

        let (sql, args) = render(json!({"ratio": {"$lt": 0.5}}), 1);
        assert!(sql.contains("::numeric < $1::double precision"));
        assert_eq!(args, vec![PGValue::Double(0.5)]);
    }

    #[test]
    fn not_equal_matches_missing_fields() {
        let (sql, args) = render(json!({"status": {"$ne": "draft"}}), 1);
        assert_eq!(sql, r#""data"->'status' IS DISTINCT FROM $1::jsonb"#);
        assert_eq!(args, vec![PGValue::Jsonb(json!("draft"))]);
    }

    #[test]
    fn null_equality() {
        let (sql, args) = render(json!({"deleted_date": null}), 1);
        assert_eq!(sql, r#"("data"->'deleted_date' IS NULL OR "data"->'deleted_date' = 'null'::jsonb)"#);
        assert!(args.is_empty());
    }

    #[test]
    fn in_uses_containment() {
        let (sql, args) = render(json!({"tags": {"$in": ["golang", "db"]}}), 1);
        assert_eq!(sql, r#""data"->'tags' @> ANY($1::jsonb[])"#);
        assert_eq!(args, vec![PGValue::JsonbArray(vec![json!("golang"), json!("db")])]);

        let (sql, args) = render(json!({"ratings": {"$in": [1, 2]}}), 1);
        assert_eq!(sql, r#""data"->'ratings' @> ANY($1::jsonb[])"#);
        assert_eq!(args, vec![PGValue::JsonbArray(vec![json!(1), json!(2)])]);

        let (sql, _) = render(json!({"tags": {"$in": []}}), 1);
        assert_eq!(sql, "FALSE");
    }

    #[test]
    fn not_in_and_all() {
        let (sql, _) = render(json!({"tags": {"$nin": ["spam"]}}), 1);
        assert_eq!(sql, r#"NOT COALESCE("data"->'tags' @> ANY($1::jsonb[]), FALSE)"#);

        let (sql, args) = render(json!({"tags": {"$all": ["golang", "db"]}}), 1);
        assert_eq!(sql, r#""data"->'tags' @> $1::jsonb"#);
        assert_eq!(args, vec![PGValue::Jsonb(json!(["golang", "db"]))]);
    }

    #[test]
    fn regex_respects_case_option() {
        let (sql, args) = render(json!({"title": {"$regex": "^go"}}), 1);
        assert_eq!(sql, r#""data"->>'title' ~ $1"#);
        assert_eq!(args, vec![PGValue::Text("^go".into())]);

        let (sql, _) = render(json!({"title": {"$regex": "^go", "$options": "i"}}), 1);
        assert_eq!(sql, r#""data"->>'title' ~* $1"#);
    }

    #[test]
    fn or_groups_share_numbering() {
        let (sql, args) = render(json!({"status": "live", "$or": [{"tags": {"$in": ["rust"]}}, {"score": {"$gt": 100}, "pinned": true}, {}]}), 2);
        assert_eq!(
            sql,
            r#""data"->>'status' = $2 AND ("data"->'tags' @> ANY($3::jsonb[]) OR (CASE WHEN jsonb_typeof("data"->'score') = 'number' THEN ("data"->>'score')::numeric > $4::bigint ELSE FALSE END AND CASE WHEN jsonb_typeof("data"->'pinned') = 'boolean' THEN ("data"->>'pinned')::boolean = $5::boolean ELSE FALSE END) OR TRUE)"#
        );
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn empty_or_adds_nothing() {
        let (sql, _) = render(json!({"$or": [], "a": "b"}), 1);
        assert_eq!(sql, r#""data"->>'a' = $1"#);
    }

    #[test]
    fn keys_are_escaped() {
        let (sql, args) = render(json!({"x') OR 1=1 --": "v"}), 1);
        assert_eq!(sql, r#""data"->>'x'') OR 1=1 --' = $1"#);
        assert_eq!(args, vec![PGValue::Text("v".into())]);
    }

    #[test]
    fn exists() {
        assert_eq!(render(json!({"deleted": {"$exists": false}}), 1).0, r#""data"->'deleted' IS NULL"#);
        assert_eq!(render(json!({"object_id": {"$exists": true}}), 1).0, "TRUE");
    }

    #[test]
    fn aliased_source_qualifies_every_reference() {
        let filter = Filter::parse(&json!({"object_id": "p1", "title": "t"})).unwrap();
        let (sql, _) = translate_from(&filter, 5, Source::aliased("doc")).unwrap();
        assert_eq!(sql, r#""doc"."object_id" = $5 AND "doc"."data"->>'title' = $6"#);
    }

    #[test]
    fn mirrored_columns_reject_wrong_types() {
        let filter = Filter::parse(&json!({"created_date": "yesterday"})).unwrap();
        assert!(matches!(translate(&filter, 1), Err(TranslationError::InvalidOperand { .. })));
    }
}
