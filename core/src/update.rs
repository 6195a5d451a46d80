//! Partial document updates.
//!
//! An update either replaces named fields, increments numeric fields, or
//! both. The descriptor accepts a flat `{"field": value}` object (replace)
//! or an explicit `{"$set": {...}, "$inc": {...}}` pair.

use serde_json::{Map, Number, Value};

use crate::document::{type_name, MIRRORED_FIELDS};
use crate::error::TranslationError;
use crate::filter::FieldPath;

/// A parsed increment amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Increment {
    Integer(i64),
    Float(f64),
}

impl Increment {
    /// Accepts JSON numbers and strings that parse as numbers.
    pub fn parse(field: &str, value: &Value) -> Result<Self, TranslationError> {
        let non_numeric = || TranslationError::NonNumericIncrement { field: field.to_owned(), value: value.to_string() };
        match value {
            Value::Number(number) => Self::from_number(number).ok_or_else(non_numeric),
            Value::String(text) => {
                let text = text.trim();
                if let Ok(integer) = text.parse::<i64>() {
                    Ok(Increment::Integer(integer))
                } else {
                    match text.parse::<f64>() {
                        Ok(float) if float.is_finite() => Ok(Increment::Float(float)),
                        _ => Err(non_numeric()),
                    }
                }
            }
            _ => Err(non_numeric()),
        }
    }

    fn from_number(number: &Number) -> Option<Self> {
        if let Some(integer) = number.as_i64() {
            Some(Increment::Integer(integer))
        } else {
            number.as_f64().filter(|float| float.is_finite()).map(Increment::Float)
        }
    }
}

impl From<Increment> for Value {
    fn from(amount: Increment) -> Self {
        match amount {
            Increment::Integer(integer) => Value::from(integer),
            Increment::Float(float) => Value::from(float),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    replace: Vec<(FieldPath, Value)>,
    increment: Vec<(FieldPath, Increment)>,
}

impl Update {
    pub fn new() -> Self { Self::default() }

    pub fn parse(value: &Value) -> Result<Self, TranslationError> {
        let Value::Object(map) = value else {
            return Err(TranslationError::NotAnObject { expected: "an update object", given: type_name(value).to_owned() });
        };

        let explicit = map.keys().any(|key| key.starts_with('$'));
        if !explicit {
            return Self::from_parts(map, &Map::new());
        }

        let empty = Map::new();
        let mut replace = &empty;
        let mut increment = &empty;
        for (key, section) in map {
            let target = match key.as_str() {
                "$set" => &mut replace,
                "$inc" => &mut increment,
                _ => return Err(TranslationError::UnsupportedOperator { field: key.clone(), operator: key.clone() }),
            };
            match section {
                Value::Object(fields) => *target = fields,
                _ => return Err(TranslationError::InvalidOperand { field: key.clone(), operator: key.clone(), expected: "an object" }),
            }
        }
        Self::from_parts(replace, increment)
    }

    /// Build an update from separate replace and increment maps.
    pub fn from_parts(replace: &Map<String, Value>, increment: &Map<String, Value>) -> Result<Self, TranslationError> {
        let mut update = Self::new();
        for (field, value) in replace {
            update.replace.push((Self::mutable_path(field)?, value.clone()));
        }
        for (field, value) in increment {
            update.increment.push((Self::mutable_path(field)?, Increment::parse(field, value)?));
        }
        if update.is_empty() {
            return Err(TranslationError::EmptyUpdate);
        }
        Ok(update)
    }

    pub fn set(mut self, path: FieldPath, value: impl Into<Value>) -> Self {
        self.replace.push((path, value.into()));
        self
    }

    pub fn inc(mut self, path: FieldPath, amount: Increment) -> Self {
        self.increment.push((path, amount));
        self
    }

    pub fn replace_fields(&self) -> &[(FieldPath, Value)] { &self.replace }

    pub fn increment_fields(&self) -> &[(FieldPath, Increment)] { &self.increment }

    pub fn is_empty(&self) -> bool { self.replace.is_empty() && self.increment.is_empty() }

    fn mutable_path(field: &str) -> Result<FieldPath, TranslationError> {
        let path = FieldPath::parse(field)?;
        if MIRRORED_FIELDS.contains(&path.first()) {
            return Err(TranslationError::ImmutableField(field.to_owned()));
        }
        Ok(path)
    }
}

impl TryFrom<Value> for Update {
    type Error = TranslationError;
    fn try_from(value: Value) -> Result<Self, Self::Error> { Update::parse(&value) }
}
