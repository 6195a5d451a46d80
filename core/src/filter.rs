//! Document filters.
//!
//! A filter arrives as a JSON object in the familiar document-database shape
//! (`{"score": {"$gt": 10}, "$or": [...]}`) and is parsed once into a typed
//! tree. Storage engines translate the tree; they never look at raw JSON.

use std::fmt;

use serde_json::{Map, Value};

use crate::document::{type_name, OBJECT_ID_FIELD};
use crate::error::TranslationError;

/// A dot separated path into a document, e.g. `author.address.city`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a dotted path, rejecting empty segments and NUL bytes.
    pub fn parse(path: &str) -> Result<Self, TranslationError> {
        let segments: Vec<String> = path.split('.').map(str::to_owned).collect();
        if segments.iter().any(|segment| segment.is_empty() || segment.contains('\0') || segment.starts_with('$')) {
            return Err(TranslationError::InvalidPath(path.to_owned()));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] { &self.0 }

    pub fn first(&self) -> &str { &self.0[0] }

    pub fn is_nested(&self) -> bool { self.0.len() > 1 }

    /// The single segment name when the path is not nested
    pub fn simple(&self) -> Option<&str> {
        match self.0.as_slice() {
            [name] => Some(name.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0.join(".")) }
}

impl TryFrom<&str> for FieldPath {
    type Error = TranslationError;
    fn try_from(path: &str) -> Result<Self, Self::Error> { FieldPath::parse(path) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    NotEqual,
}

impl ComparisonOperator {
    fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "$gt" => ComparisonOperator::GreaterThan,
            "$gte" => ComparisonOperator::GreaterThanOrEqual,
            "$lt" => ComparisonOperator::LessThan,
            "$lte" => ComparisonOperator::LessThanOrEqual,
            "$ne" => ComparisonOperator::NotEqual,
            _ => return None,
        })
    }

    pub fn key(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => "$gt",
            ComparisonOperator::GreaterThanOrEqual => "$gte",
            ComparisonOperator::LessThan => "$lt",
            ComparisonOperator::LessThanOrEqual => "$lte",
            ComparisonOperator::NotEqual => "$ne",
        }
    }
}

/// The constraint placed on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equal(Value),
    Comparison { operator: ComparisonOperator, value: Value },
    /// Field (as an array, or a scalar) shares at least one element with the set
    In(Vec<Value>),
    /// Field shares no element with the set
    NotIn(Vec<Value>),
    /// Field, as an array, contains every element of the set
    All(Vec<Value>),
    Regex { pattern: String, case_insensitive: bool },
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { path: FieldPath, condition: Condition },
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

/// A conjunction of clauses. The empty filter matches every document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self { Self::default() }

    /// Parse a JSON filter. `null` and `{}` both yield the empty filter.
    pub fn parse(value: &Value) -> Result<Self, TranslationError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Self::parse_object(map),
            other => Err(TranslationError::NotAnObject { expected: "a filter object", given: type_name(other).to_owned() }),
        }
    }

    pub fn by_object_id(object_id: impl Into<String>) -> Self {
        Self::new().with_field(
            FieldPath(vec![OBJECT_ID_FIELD.to_owned()]),
            Condition::Equal(Value::String(object_id.into())),
        )
    }

    pub fn with_field(mut self, path: FieldPath, condition: Condition) -> Self {
        self.clauses.push(Clause::Field { path, condition });
        self
    }

    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Conjunction of two filters
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn clauses(&self) -> &[Clause] { &self.clauses }

    pub fn is_empty(&self) -> bool { self.clauses.is_empty() }

    /// Top level equality constraints, in declaration order. These seed the
    /// inserted document of an upsert.
    pub fn equalities(&self) -> impl Iterator<Item = (&FieldPath, &Value)> {
        self.clauses.iter().filter_map(|clause| match clause {
            Clause::Field { path, condition: Condition::Equal(value) } => Some((path, value)),
            _ => None,
        })
    }

    /// The `object_id` this filter pins, if it has a top level equality on it
    pub fn object_id(&self) -> Option<&str> {
        self.equalities().find(|(path, _)| path.simple() == Some(OBJECT_ID_FIELD)).and_then(|(_, value)| value.as_str())
    }

    fn parse_object(map: &Map<String, Value>) -> Result<Self, TranslationError> {
        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$or" => clauses.push(Clause::Or(Self::parse_list(key, value)?)),
                "$and" => clauses.push(Clause::And(Self::parse_list(key, value)?)),
                operator if operator.starts_with('$') => {
                    return Err(TranslationError::UnsupportedOperator { field: key.clone(), operator: key.clone() });
                }
                field => {
                    let path = FieldPath::parse(field)?;
                    let condition = parse_condition(field, value)?;
                    clauses.push(Clause::Field { path, condition });
                }
            }
        }
        Ok(Self { clauses })
    }

    fn parse_list(key: &str, value: &Value) -> Result<Vec<Filter>, TranslationError> {
        let Value::Array(members) = value else {
            return Err(TranslationError::InvalidOperand { field: key.to_owned(), operator: key.to_owned(), expected: "an array of filters" });
        };
        members
            .iter()
            .map(|member| match member {
                Value::Object(map) => Self::parse_object(map),
                _ => Err(TranslationError::InvalidOperand { field: key.to_owned(), operator: key.to_owned(), expected: "an array of filters" }),
            })
            .collect()
    }
}

impl TryFrom<Value> for Filter {
    type Error = TranslationError;
    fn try_from(value: Value) -> Result<Self, Self::Error> { Filter::parse(&value) }
}

fn parse_condition(field: &str, value: &Value) -> Result<Condition, TranslationError> {
    let Value::Object(operators) = value else {
        return Ok(Condition::Equal(value.clone()));
    };

    // An object without operator keys is a literal for equality
    let operator_count = operators.keys().filter(|key| key.starts_with('$')).count();
    if operator_count == 0 {
        return Ok(Condition::Equal(value.clone()));
    }
    if operator_count != operators.len() {
        return Err(TranslationError::InvalidOperand { field: field.to_owned(), operator: "$".to_owned(), expected: "only operator keys" });
    }

    if let Some(pattern) = operators.get("$regex") {
        return parse_regex(field, pattern, operators);
    }

    let (Some((operator, operand)), 1) = (operators.iter().next(), operators.len()) else {
        return Err(TranslationError::MultipleOperators { field: field.to_owned(), count: operators.len() });
    };
    let invalid = |expected: &'static str| TranslationError::InvalidOperand { field: field.to_owned(), operator: operator.clone(), expected };

    if let Some(comparison) = ComparisonOperator::from_key(operator) {
        return match operand {
            Value::Array(_) | Value::Object(_) => Err(invalid("a scalar")),
            Value::Null if comparison != ComparisonOperator::NotEqual => Err(invalid("a non-null scalar")),
            scalar => Ok(Condition::Comparison { operator: comparison, value: scalar.clone() }),
        };
    }

    match operator.as_str() {
        "$eq" => Ok(Condition::Equal(operand.clone())),
        "$in" => operand.as_array().map(|values| Condition::In(values.clone())).ok_or_else(|| invalid("an array")),
        "$nin" => operand.as_array().map(|values| Condition::NotIn(values.clone())).ok_or_else(|| invalid("an array")),
        "$all" => operand.as_array().map(|values| Condition::All(values.clone())).ok_or_else(|| invalid("an array")),
        "$exists" => operand.as_bool().map(Condition::Exists).ok_or_else(|| invalid("a boolean")),
        "$options" => Err(invalid("a sibling $regex")),
        _ => Err(TranslationError::UnsupportedOperator { field: field.to_owned(), operator: operator.clone() }),
    }
}

fn parse_regex(field: &str, pattern: &Value, operators: &Map<String, Value>) -> Result<Condition, TranslationError> {
    let Value::String(pattern) = pattern else {
        return Err(TranslationError::InvalidOperand { field: field.to_owned(), operator: "$regex".to_owned(), expected: "a string" });
    };

    let mut case_insensitive = false;
    for (key, value) in operators {
        match key.as_str() {
            "$regex" => {}
            "$options" => match value {
                Value::String(options) => case_insensitive = options.contains('i'),
                _ => {
                    return Err(TranslationError::InvalidOperand {
                        field: field.to_owned(),
                        operator: "$options".to_owned(),
                        expected: "a string",
                    })
                }
            },
            _ => return Err(TranslationError::MultipleOperators { field: field.to_owned(), count: operators.len() }),
        }
    }

    Ok(Condition::Regex { pattern: pattern.clone(), case_insensitive })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> FieldPath { FieldPath::parse(p).unwrap() }

    #[test]
    fn empty_filter_matches_all() {
        assert!(Filter::parse(&json!({})).unwrap().is_empty());
        assert!(Filter::parse(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn literal_values_are_equality() {
        let filter = Filter::parse(&json!({"title": "hello", "meta": {"lang": "en"}})).unwrap();
        assert_eq!(
            filter.clauses(),
            &[
                Clause::Field { path: path("title"), condition: Condition::Equal(json!("hello")) },
                Clause::Field { path: path("meta"), condition: Condition::Equal(json!({"lang": "en"})) },
            ]
        );
    }

    #[test]
    fn operators_parse_into_conditions() {
        let filter = Filter::parse(&json!({
            "score": {"$gte": 10},
            "tags": {"$in": ["golang", "db"]},
            "labels": {"$all": ["a"]},
            "author.name": {"$regex": "^jo", "$options": "i"},
            "deleted": {"$exists": false}
        }))
        .unwrap();

        let conditions: Vec<&Condition> = filter
            .clauses()
            .iter()
            .map(|clause| match clause {
                Clause::Field { condition, .. } => condition,
                _ => panic!("unexpected clause"),
            })
            .collect();

        assert_eq!(conditions[0], &Condition::Comparison { operator: ComparisonOperator::GreaterThanOrEqual, value: json!(10) });
        assert_eq!(conditions[1], &Condition::In(vec![json!("golang"), json!("db")]));
        assert_eq!(conditions[2], &Condition::All(vec![json!("a")]));
        assert_eq!(conditions[3], &Condition::Regex { pattern: "^jo".into(), case_insensitive: true });
        assert_eq!(conditions[4], &Condition::Exists(false));
    }

    #[test]
    fn or_members_are_parsed_recursively() {
        let filter = Filter::parse(&json!({"$or": [{"tags": {"$in": ["rust"]}}, {"score": {"$gt": 100}}]})).unwrap();
        let Clause::Or(members) = &filter.clauses()[0] else { panic!("expected $or") };
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].clauses()[0], Clause::Field {
            path: path("score"),
            condition: Condition::Comparison { operator: ComparisonOperator::GreaterThan, value: json!(100) }
        });
    }

    #[test]
    fn in_and_all_require_arrays() {
        let err = Filter::parse(&json!({"tags": {"$in": "golang"}})).unwrap_err();
        assert_eq!(err, TranslationError::InvalidOperand { field: "tags".into(), operator: "$in".into(), expected: "an array" });

        let err = Filter::parse(&json!({"tags": {"$all": 3}})).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidOperand { operator, .. } if operator == "$all"));
    }

    #[test]
    fn or_requires_a_list_of_objects() {
        assert!(matches!(Filter::parse(&json!({"$or": {"a": 1}})), Err(TranslationError::InvalidOperand { .. })));
        assert!(matches!(Filter::parse(&json!({"$or": [1, 2]})), Err(TranslationError::InvalidOperand { .. })));
    }

    #[test]
    fn rejects_multiple_comparison_keys() {
        let err = Filter::parse(&json!({"score": {"$gt": 1, "$lt": 5}})).unwrap_err();
        assert_eq!(err, TranslationError::MultipleOperators { field: "score".into(), count: 2 });
    }

    #[test]
    fn rejects_unknown_operators_and_bad_paths() {
        assert!(matches!(Filter::parse(&json!({"a": {"$near": 1}})), Err(TranslationError::UnsupportedOperator { .. })));
        assert!(matches!(Filter::parse(&json!({"$where": "1"})), Err(TranslationError::UnsupportedOperator { .. })));
        assert!(matches!(Filter::parse(&json!({"a..b": 1})), Err(TranslationError::InvalidPath(_))));
        assert!(matches!(Filter::parse(&json!({"a": {"$regex": 5}})), Err(TranslationError::InvalidOperand { .. })));
    }

    #[test]
    fn finds_pinned_object_id() {
        let filter = Filter::parse(&json!({"object_id": "abc", "score": 3})).unwrap();
        assert_eq!(filter.object_id(), Some("abc"));
        assert_eq!(Filter::by_object_id("xyz").object_id(), Some("xyz"));
        assert_eq!(Filter::parse(&json!({"score": 3})).unwrap().object_id(), None);
    }
}
