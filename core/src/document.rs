use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::error::DocumentError;

/// Mirrored into the `object_id` column and unique per collection.
pub const OBJECT_ID_FIELD: &str = "object_id";
pub const CREATED_DATE_FIELD: &str = "created_date";
pub const LAST_UPDATED_FIELD: &str = "last_updated";
pub const DEFAULT_OWNER_FIELD: &str = "owner_user_id";
pub const DELETED_FIELD: &str = "deleted";
pub const DELETED_DATE_FIELD: &str = "deleted_date";

/// Fields that live both inside the JSON body and in their own column.
pub const MIRRORED_FIELDS: [&str; 3] = [OBJECT_ID_FIELD, CREATED_DATE_FIELD, LAST_UPDATED_FIELD];

/// A value that can be persisted in a collection.
///
/// Identity and timestamps are read through this trait rather than by
/// inspecting the serialized shape, so they can be mirrored into indexed
/// columns. Timestamps are Unix epoch seconds.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    fn object_id(&self) -> &str;

    /// Owner used by ownership-scoped mutations, if the document has one.
    fn owner_id(&self) -> Option<&str> { None }

    fn created_date(&self) -> i64;

    fn last_updated(&self) -> i64;
}

/// Serialize a document into the JSON body that is stored in the `data`
/// column, with the identity and timestamp fields forced to the values the
/// trait reports.
pub fn to_body<D: Document>(document: &D) -> Result<Map<String, Value>, DocumentError> {
    let object_id = document.object_id();
    if object_id.is_empty() {
        return Err(DocumentError::InvalidDocument("object_id must not be empty".into()));
    }

    let mut body = match serde_json::to_value(document)? {
        Value::Object(map) => map,
        other => return Err(DocumentError::InvalidDocument(format!("documents must serialize to an object, got {}", type_name(&other)))),
    };

    body.insert(OBJECT_ID_FIELD.to_owned(), Value::from(object_id));
    body.insert(CREATED_DATE_FIELD.to_owned(), Value::from(document.created_date()));
    body.insert(LAST_UPDATED_FIELD.to_owned(), Value::from(document.last_updated()));
    Ok(body)
}

pub fn unix_now() -> i64 { chrono::Utc::now().timestamp() }

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
