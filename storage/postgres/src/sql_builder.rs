use docstore_core::filter::FieldPath;

use crate::value::PGValue;

/// The JSON column of every collection table.
pub const DATA: &str = r#""data""#;

pub enum SqlExpr {
    Sql(String),
    Argument(PGValue),
}

/// SQL text interleaved with arguments. Placeholders are only numbered when
/// the statement is collapsed, so fragments can be built independently and
/// appended in any order.
#[derive(Default)]
pub struct Sql(Vec<SqlExpr>);

impl Sql {
    pub fn new() -> Self { Self(Vec::new()) }

    pub fn push(&mut self, expr: SqlExpr) { self.0.push(expr); }

    pub fn arg(&mut self, arg: impl Into<PGValue>) { self.push(SqlExpr::Argument(arg.into())); }

    pub fn sql(&mut self, s: impl AsRef<str>) { self.push(SqlExpr::Sql(s.as_ref().to_owned())); }

    pub fn append(&mut self, other: Sql) { self.0.extend(other.0); }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn collapse(self) -> (String, Vec<PGValue>) { self.collapse_from(1) }

    /// Render with placeholders numbered from `start`.
    pub fn collapse_from(self, start: usize) -> (String, Vec<PGValue>) {
        let mut counter = start;
        let mut sql = String::new();
        let mut args = Vec::new();

        for expr in self.0 {
            match expr {
                SqlExpr::Argument(arg) => {
                    sql += &format!("${}", counter);
                    args.push(arg);
                    counter += 1;
                }
                SqlExpr::Sql(s) => {
                    sql += &s;
                }
            }
        }

        (sql, args)
    }
}

pub fn quote_identifier(name: &str) -> String { format!(r#""{}""#, name.replace('"', "\"\"")) }

pub fn quote_literal(value: &str) -> String { format!("'{}'", value.replace('\'', "''")) }

/// `"data"->'a'->'b'`: the field as jsonb
pub fn json_path(source: &str, path: &FieldPath) -> String {
    let mut expr = source.to_owned();
    for segment in path.segments() {
        expr.push_str("->");
        expr.push_str(&quote_literal(segment));
    }
    expr
}

/// `"data"->'a'->>'b'`: the field as text
pub fn text_path(source: &str, path: &FieldPath) -> String {
    let segments = path.segments();
    let mut expr = source.to_owned();
    for (index, segment) in segments.iter().enumerate() {
        expr.push_str(if index + 1 == segments.len() { "->>" } else { "->" });
        expr.push_str(&quote_literal(segment));
    }
    expr
}

/// `ARRAY['a','b']`: the path argument of `jsonb_set`
pub fn path_array(path: &FieldPath) -> String {
    let segments: Vec<String> = path.segments().iter().map(|segment| quote_literal(segment)).collect();
    format!("ARRAY[{}]", segments.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath { FieldPath::parse(p).unwrap() }

    #[test]
    fn numbers_placeholders_from_offset() {
        let mut sql = Sql::new();
        sql.sql("a = ");
        sql.arg("x");
        sql.sql(" AND b = ");
        sql.arg(3i64);

        let (text, args) = sql.collapse_from(4);
        assert_eq!(text, "a = $4 AND b = $5");
        assert_eq!(args, vec![PGValue::Text("x".into()), PGValue::BigInt(3)]);
    }

    #[test]
    fn appended_fragments_share_numbering() {
        let mut left = Sql::new();
        left.arg("a");
        let mut right = Sql::new();
        right.sql(", ");
        right.arg("b");
        left.append(right);
        assert_eq!(left.collapse().0, "$1, $2");
    }

    #[test]
    fn paths_escape_keys() {
        assert_eq!(json_path(DATA, &path("author.name")), r#""data"->'author'->'name'"#);
        assert_eq!(text_path(DATA, &path("author.name")), r#""data"->'author'->>'name'"#);
        assert_eq!(text_path(DATA, &path("it's")), r#""data"->>'it''s'"#);
        assert_eq!(path_array(&path("meta.lang")), "ARRAY['meta','lang']");
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }
}
