use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DocumentError, TranslationError};
use crate::filter::FieldPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub path: FieldPath,
    pub direction: SortDirection,
}

impl SortField {
    pub fn new(field: &str, direction: SortDirection) -> Result<Self, TranslationError> {
        Ok(Self { path: FieldPath::parse(field)?, direction })
    }

    pub fn ascending(field: &str) -> Result<Self, TranslationError> { Self::new(field, SortDirection::Ascending) }

    pub fn descending(field: &str) -> Result<Self, TranslationError> { Self::new(field, SortDirection::Descending) }
}

/// Sort, limit and skip for `find`. Without a sort, documents come back in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortField>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self { Self::default() }

    pub fn sort(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert the document when nothing matches. Requires the filter to pin
    /// an `object_id`.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self { Self { upsert: true } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    /// Surrogate id of the inserted row when an upsert inserted
    pub upserted_id: Option<i64>,
}

/// Page size used when a cursor query asks for zero rows
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Request for one page of keyset pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorQuery {
    pub sort: SortField,
    pub limit: u64,
    /// Opaque token from a previous page's `next_cursor`
    pub cursor: Option<String>,
}

impl CursorQuery {
    pub fn new(sort: SortField, limit: u64) -> Self { Self { sort, limit, cursor: None } }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn page_size(&self) -> u64 {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            limit => limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Position after the last row of a page: the sort value plus the surrogate
/// id that breaks ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "f")]
    pub field: String,
    #[serde(rename = "d")]
    pub direction: SortDirection,
    #[serde(rename = "v")]
    pub value: Value,
    #[serde(rename = "id")]
    pub id: i64,
}

impl Cursor {
    pub fn encode(&self) -> Result<String, DocumentError> {
        let json = serde_json::to_vec(self)?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, DocumentError> {
        let bytes = general_purpose::URL_SAFE_NO_PAD.decode(token).map_err(|err| DocumentError::InvalidCursor(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| DocumentError::InvalidCursor(err.to_string()))
    }

    /// Decode a token and check it was issued for the same ordering.
    pub fn decode_for(token: &str, sort: &SortField) -> Result<Self, DocumentError> {
        let cursor = Self::decode(token)?;
        if cursor.field != sort.path.to_string() || cursor.direction != sort.direction {
            return Err(DocumentError::InvalidCursor(format!("cursor was issued for a different sort ({} {:?})", cursor.field, cursor.direction)));
        }
        Ok(cursor)
    }
}

/// An expression index over one document field.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub field: FieldPath,
    pub unique: bool,
    /// Defaults to `<collection>_<field>_idx`
    pub name: Option<String>,
}

impl IndexSpec {
    pub fn new(field: &str) -> Result<Self, TranslationError> { Ok(Self { field: FieldPath::parse(field)?, unique: false, name: None }) }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_token_round_trips_and_checks_sort() {
        let sort = SortField::descending("score").unwrap();
        let cursor = Cursor { field: "score".into(), direction: SortDirection::Descending, value: json!(7), id: 12 };
        let token = cursor.encode().unwrap();
        assert_eq!(Cursor::decode_for(&token, &sort).unwrap(), cursor);

        let other = SortField::ascending("score").unwrap();
        assert!(matches!(Cursor::decode_for(&token, &other), Err(DocumentError::InvalidCursor(_))));
        assert!(matches!(Cursor::decode("not base64!"), Err(DocumentError::InvalidCursor(_))));
    }
}
