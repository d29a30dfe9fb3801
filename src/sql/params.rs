//! Convert serde_json::Value to types that sqlx can bind.

use crate::config::FieldType;
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

/// A value that can be bound to a PostgreSQL query. Converts from serde_json::Value.
/// Placeholders carry an explicit `$n::type` cast, so the declared type only has to be castable.
#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    TextArray(Vec<String>),
    I64Array(Vec<i64>),
    Json(Value),
}

impl PgBindValue {
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PgBindValue::I64(i)
                } else {
                    PgBindValue::F64(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => PgBindValue::String(s.clone()),
            Value::Array(items) => {
                if let Some(strings) = items.iter().map(|i| i.as_str().map(str::to_string)).collect::<Option<Vec<_>>>() {
                    PgBindValue::TextArray(strings)
                } else if let Some(ints) = items.iter().map(Value::as_i64).collect::<Option<Vec<_>>>() {
                    PgBindValue::I64Array(ints)
                } else {
                    PgBindValue::Json(v.clone())
                }
            }
            Value::Object(_) => PgBindValue::Json(v.clone()),
        }
    }

    /// Bind according to the declared field type: json fields always bind as JSONB.
    pub fn for_field(v: &Value, type_: FieldType) -> Self {
        match (type_, v) {
            (_, Value::Null) => PgBindValue::Null,
            (FieldType::Json, _) => PgBindValue::Json(v.clone()),
            (FieldType::TextArray, Value::Array(items)) => {
                PgBindValue::TextArray(items.iter().map(json_to_text).collect())
            }
            _ => Self::from_json(v),
        }
    }
}

/// Scalar text form of a JSON value (strings unquoted).
pub fn json_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            PgBindValue::Null => IsNull::Yes,
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::String(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
            PgBindValue::TextArray(v) => <Vec<String> as Encode<Postgres>>::encode_by_ref(v, buf)?,
            PgBindValue::I64Array(v) => <Vec<i64> as Encode<Postgres>>::encode_by_ref(v, buf)?,
            PgBindValue::Json(v) => <serde_json::Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(match self {
            PgBindValue::Null | PgBindValue::String(_) => PgTypeInfo::with_name("TEXT"),
            PgBindValue::Bool(_) => PgTypeInfo::with_name("BOOL"),
            PgBindValue::I64(_) => PgTypeInfo::with_name("INT8"),
            PgBindValue::F64(_) => PgTypeInfo::with_name("FLOAT8"),
            PgBindValue::TextArray(_) => PgTypeInfo::with_name("_TEXT"),
            PgBindValue::I64Array(_) => PgTypeInfo::with_name("_INT8"),
            PgBindValue::Json(_) => PgTypeInfo::with_name("JSONB"),
        })
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_arrays_bind_as_postgres_arrays() {
        assert_eq!(
            PgBindValue::from_json(&json!(["a", "b"])),
            PgBindValue::TextArray(vec!["a".into(), "b".into()])
        );
        assert_eq!(PgBindValue::from_json(&json!([1, 2])), PgBindValue::I64Array(vec![1, 2]));
        assert!(matches!(PgBindValue::from_json(&json!([1, "x"])), PgBindValue::Json(_)));
    }

    #[test]
    fn json_fields_bind_as_jsonb() {
        let v = json!(["a", "b"]);
        assert_eq!(PgBindValue::for_field(&v, FieldType::Json), PgBindValue::Json(v.clone()));
        assert_eq!(PgBindValue::for_field(&json!(2.5), FieldType::Number), PgBindValue::F64(2.5));
        assert_eq!(PgBindValue::for_field(&Value::Null, FieldType::Json), PgBindValue::Null);
    }
}
