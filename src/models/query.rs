use serde::{Deserialize, Serialize};

/// Closed union of values accepted as query parameters on the external
/// surface. Tool-level inputs are mapped into this union before anything is
/// bound against the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl QueryParam {
    /// Map a JSON argument value into the union. Objects and arrays are not
    /// valid parameters.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Ok(QueryParam::Null),
            serde_json::Value::Bool(b) => Ok(QueryParam::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(QueryParam::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(QueryParam::Float(f))
                } else {
                    Err(format!("unrepresentable numeric parameter: {n}"))
                }
            }
            serde_json::Value::String(s) => Ok(QueryParam::Text(s.clone())),
            other => Err(format!(
                "unsupported parameter type: {}",
                match other {
                    serde_json::Value::Array(_) => "array",
                    serde_json::Value::Object(_) => "object",
                    _ => "unknown",
                }
            )),
        }
    }
}

/// Column metadata reported alongside query rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    pub data_type: String,
}

/// The result envelope returned by every query execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_from_json_scalars() {
        assert_eq!(QueryParam::from_json(&json!(null)).unwrap(), QueryParam::Null);
        assert_eq!(
            QueryParam::from_json(&json!(true)).unwrap(),
            QueryParam::Bool(true)
        );
        assert_eq!(QueryParam::from_json(&json!(42)).unwrap(), QueryParam::Int(42));
        assert_eq!(
            QueryParam::from_json(&json!(2.5)).unwrap(),
            QueryParam::Float(2.5)
        );
        assert_eq!(
            QueryParam::from_json(&json!("x")).unwrap(),
            QueryParam::Text("x".to_string())
        );
    }

    #[test]
    fn test_param_from_json_rejects_composites() {
        assert!(QueryParam::from_json(&json!([1, 2])).is_err());
        assert!(QueryParam::from_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_envelope_serializes_camel_case() {
        let result = QueryResult {
            rows: vec![json!({"n": 1})],
            row_count: 1,
            truncated: false,
            fields: None,
            command: Some("SELECT".to_string()),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["rowCount"], 1);
        assert!(value.get("fields").is_none());
        assert_eq!(value["command"], "SELECT");
    }
}
