use bytes::BytesMut;
use serde_json::Value;
use tokio_postgres::types::{IsNull, ToSql, Type};

/// A bound statement argument.
#[derive(Debug, Clone, PartialEq)]
pub enum PGValue {
    Text(String),
    BigInt(i64),
    Double(f64),
    Boolean(bool),
    Jsonb(Value),
    TextArray(Vec<String>),
    BigIntArray(Vec<i64>),
    JsonbArray(Vec<Value>),
}

impl ToSql for PGValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            PGValue::Text(value) => value.to_sql(ty, out),
            PGValue::BigInt(value) => value.to_sql(ty, out),
            PGValue::Double(value) => value.to_sql(ty, out),
            PGValue::Boolean(value) => value.to_sql(ty, out),
            PGValue::Jsonb(value) => value.to_sql(ty, out),
            PGValue::TextArray(value) => value.to_sql(ty, out),
            PGValue::BigIntArray(value) => value.to_sql(ty, out),
            PGValue::JsonbArray(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool { true }

    // `accepts` cannot see the variant, so type checking is left to the inner value
    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.inner().to_sql_checked(ty, out)
    }
}

impl PGValue {
    fn inner(&self) -> &(dyn ToSql + Sync) {
        match self {
            PGValue::Text(value) => value,
            PGValue::BigInt(value) => value,
            PGValue::Double(value) => value,
            PGValue::Boolean(value) => value,
            PGValue::Jsonb(value) => value,
            PGValue::TextArray(value) => value,
            PGValue::BigIntArray(value) => value,
            PGValue::JsonbArray(value) => value,
        }
    }
}

impl From<&str> for PGValue {
    fn from(value: &str) -> Self { PGValue::Text(value.to_owned()) }
}

impl From<String> for PGValue {
    fn from(value: String) -> Self { PGValue::Text(value) }
}

impl From<i64> for PGValue {
    fn from(value: i64) -> Self { PGValue::BigInt(value) }
}

impl From<Value> for PGValue {
    fn from(value: Value) -> Self { PGValue::Jsonb(value) }
}

/// Borrow arguments in the shape the driver's query methods expect.
pub fn params(args: &[PGValue]) -> Vec<&(dyn ToSql + Sync)> { args.iter().map(|arg| arg as &(dyn ToSql + Sync)).collect() }
