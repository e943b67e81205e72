use serde_json::{Map, Value};

use crate::models::QueryParam;
use crate::services::ConnectionManager;

use super::{optional_bool, optional_str, required_str};

/// Parse the JSON `params` array into the driver parameter union.
fn parse_params(args: &Map<String, Value>) -> Result<Vec<QueryParam>, String> {
    match args.get("params") {
        Some(Value::Array(values)) => values.iter().map(QueryParam::from_json).collect(),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err("params must be an array".to_string()),
    }
}

pub async fn execute_query(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let sql = required_str(args, "sql")?;
    let params = parse_params(args)?;
    let result = manager
        .execute_query(sql, &params)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(result).map_err(|e| e.to_string())
}

pub async fn explain_query(
    manager: &ConnectionManager,
    args: &Map<String, Value>,
) -> Result<Value, String> {
    let sql = required_str(args, "sql")?;
    let analyze = optional_bool(args, "analyze", false);
    let format = optional_str(args, "format", "text");
    let params = parse_params(args)?;

    let mut options = Vec::new();
    if analyze {
        options.push("ANALYZE".to_string());
    }
    if !format.eq_ignore_ascii_case("text") {
        options.push(format!("FORMAT {}", format.to_ascii_uppercase()));
    }
    let explain_sql = if options.is_empty() {
        format!("EXPLAIN {sql}")
    } else {
        format!("EXPLAIN ({}) {sql}", options.join(", "))
    };

    let result = manager
        .execute_query(&explain_sql, &params)
        .await
        .map_err(|e| e.to_string())?;

    Ok(Value::String(stringify_plan(&result.rows, format)))
}

/// Flatten the driver's `QUERY PLAN` rows into one string. Text plans are
/// one line per row; structured formats come back in a single row.
fn stringify_plan(rows: &[Value], format: &str) -> String {
    let mut parts = Vec::with_capacity(rows.len());
    for row in rows {
        let value = row
            .get("QUERY PLAN")
            .or_else(|| row.as_object().and_then(|o| o.values().next()));
        match value {
            Some(Value::String(line)) => parts.push(line.clone()),
            Some(other) => parts.push(
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            ),
            None => {}
        }
    }
    if format.eq_ignore_ascii_case("text") {
        parts.join("\n")
    } else {
        parts.join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params_accepts_scalars() {
        let mut args = Map::new();
        args.insert("params".to_string(), json!([1, "a", true, null, 1.5]));
        let params = parse_params(&args).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Int(1),
                QueryParam::Text("a".to_string()),
                QueryParam::Bool(true),
                QueryParam::Null,
                QueryParam::Float(1.5),
            ]
        );
    }

    #[test]
    fn test_parse_params_rejects_nested() {
        let mut args = Map::new();
        args.insert("params".to_string(), json!([{"a": 1}]));
        assert!(parse_params(&args).is_err());
    }

    #[test]
    fn test_stringify_text_plan_joins_lines() {
        let rows = vec![
            json!({"QUERY PLAN": "Seq Scan on users"}),
            json!({"QUERY PLAN": "  Filter: (id > 1)"}),
        ];
        assert_eq!(
            stringify_plan(&rows, "text"),
            "Seq Scan on users\n  Filter: (id > 1)"
        );
    }

    #[test]
    fn test_stringify_json_plan() {
        let rows = vec![json!({"QUERY PLAN": [{"Plan": {"Node Type": "Seq Scan"}}]})];
        let plan = stringify_plan(&rows, "json");
        assert!(plan.contains("Seq Scan"));
    }
}
