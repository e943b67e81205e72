use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::models::FieldInfo;

/// Column metadata for a result set.
pub fn field_info(row: &PgRow) -> Vec<FieldInfo> {
    row.columns()
        .iter()
        .map(|column| FieldInfo {
            name: column.name().to_string(),
            data_type: column.type_info().name().to_string(),
        })
        .collect()
}

/// Convert one row into a JSON object keyed by column name. Values that
/// cannot be decoded are reported as null rather than failing the query.
pub fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(_) => return Value::Null,
    }

    let decoded = match type_name {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(|v| json!(v)),
        "INT4" => row.try_get::<i32, _>(index).map(|v| json!(v)),
        "INT8" => row.try_get::<i64, _>(index).map(|v| json!(v)),
        "OID" => row
            .try_get::<sqlx::postgres::types::Oid, _>(index)
            .map(|v| json!(v.0)),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| json!(v)),
        "FLOAT8" => row.try_get::<f64, _>(index).map(|v| json!(v)),
        // Numerics are reported as strings to avoid silent precision loss.
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(index)
            .map(|v| Value::String(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
            row.try_get::<String, _>(index).map(Value::String)
        }
        "UUID" => row
            .try_get::<uuid::Uuid, _>(index)
            .map(|v| Value::String(v.to_string())),
        "JSON" | "JSONB" => row.try_get::<Value, _>(index),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|v| Value::String(v.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|v| Value::String(v.to_string())),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(index)
            .map(|v| Value::String(v.to_string())),
        "BYTEA" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|v| Value::String(BASE64.encode(v))),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => row
            .try_get::<Vec<String>, _>(index)
            .map(|v| json!(v)),
        "INT4[]" => row.try_get::<Vec<i32>, _>(index).map(|v| json!(v)),
        "INT8[]" => row.try_get::<Vec<i64>, _>(index).map(|v| json!(v)),
        _ => row.try_get::<String, _>(index).map(Value::String),
    };

    match decoded {
        Ok(value) => value,
        Err(e) => {
            log::debug!("failed to decode column {index} ({type_name}): {e}");
            Value::Null
        }
    }
}
