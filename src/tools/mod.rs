pub mod admin;
pub mod query;
pub mod schema;

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::models::ToolResponse;
use crate::services::ConnectionManager;

/// Errors that belong to the protocol layer rather than the tool envelope.
#[derive(Debug)]
pub enum ToolCallError {
    UnknownTool(String),
    InvalidArguments(String),
}

impl std::fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolCallError::UnknownTool(name) => write!(f, "Unknown tool: {name}"),
            ToolCallError::InvalidArguments(reason) => {
                write!(f, "Invalid arguments: {reason}")
            }
        }
    }
}

/// Declares the tool surface and dispatches invocations to handlers.
pub struct ToolRegistry {
    manager: Arc<ConnectionManager>,
}

impl ToolRegistry {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        ToolRegistry { manager }
    }

    /// Tool declarations in a fixed, deterministic order.
    pub fn definitions() -> Vec<Value> {
        vec![
            tool(
                "execute_query",
                "Execute a SQL query against the connected PostgreSQL database. \
                 In read-only mode only SELECT-like statements are accepted.",
                json!({
                    "type": "object",
                    "properties": {
                        "sql": {
                            "type": "string",
                            "description": "The SQL statement to execute"
                        },
                        "params": {
                            "type": "array",
                            "description": "Positional parameters referenced as $1, $2, …",
                            "items": {}
                        }
                    },
                    "required": ["sql"]
                }),
                query_result_schema(),
            ),
            tool(
                "explain_query",
                "Show the execution plan for a SQL query.",
                json!({
                    "type": "object",
                    "properties": {
                        "sql": {
                            "type": "string",
                            "description": "The SQL statement to explain"
                        },
                        "analyze": {
                            "type": "boolean",
                            "description": "Actually execute the statement to collect timings",
                            "default": false
                        },
                        "format": {
                            "type": "string",
                            "enum": ["text", "json", "yaml", "xml"],
                            "default": "text"
                        }
                    },
                    "required": ["sql"]
                }),
                json!({
                    "type": "object",
                    "properties": { "result": { "type": "string" } },
                    "required": ["result"]
                }),
            ),
            tool(
                "list_schemas",
                "List schemas in the current database.",
                json!({
                    "type": "object",
                    "properties": {
                        "includeSystem": {
                            "type": "boolean",
                            "description": "Include pg_* and information_schema",
                            "default": false
                        }
                    }
                }),
                array_result_schema(),
            ),
            tool(
                "list_tables",
                "List tables (and optionally views) in a schema with size estimates.",
                json!({
                    "type": "object",
                    "properties": {
                        "schema": { "type": "string", "default": "public" },
                        "includeViews": { "type": "boolean", "default": false }
                    }
                }),
                array_result_schema(),
            ),
            tool(
                "describe_table",
                "Describe a table: columns, constraints, and indexes.",
                json!({
                    "type": "object",
                    "properties": {
                        "schema": { "type": "string", "default": "public" },
                        "table": { "type": "string" }
                    },
                    "required": ["table"]
                }),
                json!({
                    "type": "object",
                    "properties": { "result": { "type": "object" } },
                    "required": ["result"]
                }),
            ),
            tool(
                "list_databases",
                "List databases on the server with owner, encoding, and size.",
                json!({ "type": "object", "properties": {} }),
                array_result_schema(),
            ),
            tool(
                "get_connection_status",
                "Report tunnel, pool, and connection state.",
                json!({ "type": "object", "properties": {} }),
                json!({
                    "type": "object",
                    "properties": { "result": { "type": "object" } },
                    "required": ["result"]
                }),
            ),
            tool(
                "get_database_version",
                "Report the PostgreSQL server version string.",
                json!({ "type": "object", "properties": {} }),
                json!({
                    "type": "object",
                    "properties": { "result": { "type": "string" } },
                    "required": ["result"]
                }),
            ),
            tool(
                "get_database_size",
                "Report the current database size and its largest tables.",
                json!({
                    "type": "object",
                    "properties": {
                        "limit": {
                            "type": "integer",
                            "description": "How many tables to list",
                            "default": 10
                        }
                    }
                }),
                json!({
                    "type": "object",
                    "properties": { "result": { "type": "object" } },
                    "required": ["result"]
                }),
            ),
            tool(
                "get_table_stats",
                "Report planner/vacuum statistics for one table.",
                json!({
                    "type": "object",
                    "properties": {
                        "schema": { "type": "string", "default": "public" },
                        "table": { "type": "string" }
                    },
                    "required": ["table"]
                }),
                json!({
                    "type": "object",
                    "properties": { "result": { "type": "object" } },
                    "required": ["result"]
                }),
            ),
            tool(
                "list_active_connections",
                "List current server backends from pg_stat_activity.",
                json!({
                    "type": "object",
                    "properties": {
                        "includeIdle": { "type": "boolean", "default": false }
                    }
                }),
                array_result_schema(),
            ),
            tool(
                "list_long_running_queries",
                "List queries running longer than a threshold.",
                json!({
                    "type": "object",
                    "properties": {
                        "minDurationSeconds": { "type": "number", "default": 5 }
                    }
                }),
                array_result_schema(),
            ),
        ]
    }

    /// Validate arguments against the declared schema, fill defaults, and
    /// dispatch. Handler failures come back as `isError` tool responses;
    /// only unknown tools and schema violations surface as protocol errors.
    pub async fn call(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolResponse, ToolCallError> {
        let definitions = Self::definitions();
        let definition = definitions
            .iter()
            .find(|d| d["name"] == name)
            .ok_or_else(|| ToolCallError::UnknownTool(name.to_string()))?;
        let args = validate_arguments(&definition["inputSchema"], arguments)
            .map_err(ToolCallError::InvalidArguments)?;

        let manager = &self.manager;
        let outcome = match name {
            "execute_query" => query::execute_query(manager, &args).await,
            "explain_query" => query::explain_query(manager, &args).await,
            "list_schemas" => schema::list_schemas(manager, &args).await,
            "list_tables" => schema::list_tables(manager, &args).await,
            "describe_table" => schema::describe_table(manager, &args).await,
            "list_databases" => schema::list_databases(manager).await,
            "get_connection_status" => admin::get_connection_status(manager).await,
            "get_database_version" => admin::get_database_version(manager).await,
            "get_database_size" => admin::get_database_size(manager, &args).await,
            "get_table_stats" => admin::get_table_stats(manager, &args).await,
            "list_active_connections" => admin::list_active_connections(manager, &args).await,
            "list_long_running_queries" => {
                admin::list_long_running_queries(manager, &args).await
            }
            other => return Err(ToolCallError::UnknownTool(other.to_string())),
        };

        Ok(match outcome {
            Ok(result) => ToolResponse::success(result),
            Err(message) => ToolResponse::error(message),
        })
    }
}

fn tool(name: &str, description: &str, input_schema: Value, output_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
        "outputSchema": output_schema,
    })
}

fn query_result_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "result": {
                "type": "object",
                "properties": {
                    "rows": { "type": "array" },
                    "rowCount": { "type": "integer" },
                    "truncated": { "type": "boolean" },
                    "fields": { "type": "array" }
                },
                "required": ["rows", "rowCount", "truncated"]
            }
        },
        "required": ["result"]
    })
}

fn array_result_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "result": { "type": "array" } },
        "required": ["result"]
    })
}

/// Check provided arguments against a declared object schema and merge in
/// defaults. Unknown keys are tolerated; type mismatches are not.
pub fn validate_arguments(
    schema: &Value,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let empty = Map::new();
    let properties = schema["properties"].as_object().unwrap_or(&empty);

    if let Some(required) = schema["required"].as_array() {
        for name in required.iter().filter_map(Value::as_str) {
            if !provided.contains_key(name) {
                return Err(format!("missing required argument: {name}"));
            }
        }
    }

    let mut merged = Map::new();
    for (name, property) in properties {
        match provided.get(name) {
            Some(value) if !value.is_null() => {
                check_type(name, property, value)?;
                if let Some(allowed) = property["enum"].as_array() {
                    if !allowed.contains(value) {
                        return Err(format!(
                            "argument {name} must be one of {allowed:?}"
                        ));
                    }
                }
                merged.insert(name.clone(), value.clone());
            }
            _ => {
                if let Some(default) = property.get("default") {
                    merged.insert(name.clone(), default.clone());
                }
            }
        }
    }
    Ok(merged)
}

fn check_type(name: &str, property: &Value, value: &Value) -> Result<(), String> {
    let Some(expected) = property["type"].as_str() else {
        return Ok(());
    };
    let ok = match expected {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("argument {name} must be of type {expected}"))
    }
}

pub(crate) fn required_str<'a>(
    args: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a str, String> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument: {name}"))
}

pub(crate) fn optional_bool(args: &Map<String, Value>, name: &str, default: bool) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn optional_i64(args: &Map<String, Value>, name: &str, default: i64) -> i64 {
    args.get(name).and_then(Value::as_i64).unwrap_or(default)
}

pub(crate) fn optional_f64(args: &Map<String, Value>, name: &str, default: f64) -> f64 {
    args.get(name).and_then(Value::as_f64).unwrap_or(default)
}

pub(crate) fn optional_str<'a>(
    args: &'a Map<String, Value>,
    name: &'a str,
    default: &'a str,
) -> &'a str {
    args.get(name).and_then(Value::as_str).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_are_stable_and_complete() {
        let names: Vec<String> = ToolRegistry::definitions()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "execute_query",
                "explain_query",
                "list_schemas",
                "list_tables",
                "describe_table",
                "list_databases",
                "get_connection_status",
                "get_database_version",
                "get_database_size",
                "get_table_stats",
                "list_active_connections",
                "list_long_running_queries",
            ]
        );
        // Ordering is deterministic across calls.
        let again: Vec<String> = ToolRegistry::definitions()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, again);
    }

    #[test]
    fn test_every_tool_declares_schemas() {
        for definition in ToolRegistry::definitions() {
            assert!(definition["description"].as_str().is_some());
            assert_eq!(definition["inputSchema"]["type"], "object");
            assert_eq!(definition["outputSchema"]["type"], "object");
        }
    }

    #[test]
    fn test_validate_arguments_requires_and_defaults() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string" },
                "analyze": { "type": "boolean", "default": false }
            },
            "required": ["sql"]
        });

        let err = validate_arguments(&schema, &Map::new()).unwrap_err();
        assert!(err.contains("sql"));

        let mut provided = Map::new();
        provided.insert("sql".to_string(), serde_json::json!("SELECT 1"));
        let merged = validate_arguments(&schema, &provided).unwrap();
        assert_eq!(merged["sql"], "SELECT 1");
        assert_eq!(merged["analyze"], false);
    }

    #[test]
    fn test_validate_arguments_type_mismatch() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "limit": { "type": "integer" } }
        });
        let mut provided = Map::new();
        provided.insert("limit".to_string(), serde_json::json!("ten"));
        assert!(validate_arguments(&schema, &provided).is_err());
    }

    #[test]
    fn test_validate_arguments_enum() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "format": { "type": "string", "enum": ["text", "json"] }
            }
        });
        let mut provided = Map::new();
        provided.insert("format".to_string(), serde_json::json!("csv"));
        assert!(validate_arguments(&schema, &provided).is_err());
        provided.insert("format".to_string(), serde_json::json!("json"));
        assert!(validate_arguments(&schema, &provided).is_ok());
    }
}
