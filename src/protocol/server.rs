use std::sync::Arc;
use std::sync::Mutex;

use serde_json::{json, Map, Value};

use crate::tools::ToolRegistry;

use super::{codes, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, SERVER_NAME};

/// Per-client handshake state. Small enough to scrub wholesale.
#[derive(Default)]
struct ClientState {
    info: Option<Value>,
    capabilities: Option<Value>,
    logging_level: Option<String>,
    initialized: bool,
}

/// One MCP server endpoint: handshake, tool listing, tool invocation.
///
/// Requests are handled through `&self` so a slow tool call never blocks
/// unrelated requests on the same transport; only the tiny client state is
/// behind a lock. `reset` returns the instance to the pool as good as new.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    client: Mutex<ClientState>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        McpServer {
            registry,
            client: Mutex::new(ClientState::default()),
        }
    }

    /// Scrub all client state so the instance can serve an unrelated
    /// request (stateless HTTP mode).
    pub fn reset(&self) {
        *self.client.lock().expect("client state lock poisoned") = ClientState::default();
    }

    /// Handle one request. Notifications return `None`.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(id, &request.params)),
            "notifications/initialized" => {
                self.client
                    .lock()
                    .expect("client state lock poisoned")
                    .initialized = true;
                None
            }
            "ping" => Some(JsonRpcResponse::result(id, json!({}))),
            "tools/list" => Some(JsonRpcResponse::result(
                id,
                json!({ "tools": ToolRegistry::definitions() }),
            )),
            "tools/call" => Some(self.handle_tool_call(id, &request.params).await),
            "logging/setLevel" => {
                self.client
                    .lock()
                    .expect("client state lock poisoned")
                    .logging_level = request.params["level"].as_str().map(str::to_string);
                Some(JsonRpcResponse::result(id, json!({})))
            }
            other => {
                if request.is_notification() {
                    log::debug!("ignoring notification {other}");
                    None
                } else {
                    Some(JsonRpcResponse::error(
                        id,
                        codes::METHOD_NOT_FOUND,
                        format!("Method not found: {other}"),
                    ))
                }
            }
        }
    }

    fn handle_initialize(&self, id: Value, params: &Value) -> JsonRpcResponse {
        {
            let mut client = self.client.lock().expect("client state lock poisoned");
            client.info = params.get("clientInfo").cloned();
            client.capabilities = params.get("capabilities").cloned();
            client.initialized = false;
        }

        JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": true }
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
    }

    async fn handle_tool_call(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                "tools/call requires a tool name",
            );
        };
        let empty = Map::new();
        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        match self.registry.call(name, arguments).await {
            Ok(response) => match serde_json::to_value(&response) {
                Ok(result) => JsonRpcResponse::result(id, result),
                Err(e) => JsonRpcResponse::error(
                    id,
                    codes::INTERNAL_ERROR,
                    format!("failed to serialize tool response: {e}"),
                ),
            },
            Err(error) => JsonRpcResponse::error(id, codes::INVALID_PARAMS, error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::ConnectionManager;
    use std::collections::HashMap;

    fn test_server() -> McpServer {
        let vars: HashMap<String, String> = [
            ("DATABASE_NAME".to_string(), "appdb".to_string()),
            ("DATABASE_USER".to_string(), "app".to_string()),
        ]
        .into_iter()
        .collect();
        let config = Config::from_map(&vars).unwrap();
        let manager = Arc::new(ConnectionManager::new(&config));
        McpServer::new(Arc::new(ToolRegistry::new(manager)))
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let server = test_server();
        let response = server
            .handle(request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "t", "version": "0"}
                }),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "postgresql-ssh-mcp");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_tools_list_contains_all_tools() {
        let server = test_server();
        let response = server.handle(request("tools/list", Value::Null)).await.unwrap();
        let tools = response.result.unwrap()["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "execute_query",
            "explain_query",
            "list_schemas",
            "list_tables",
            "describe_table",
            "list_databases",
            "get_connection_status",
            "list_active_connections",
            "list_long_running_queries",
            "get_database_version",
            "get_database_size",
            "get_table_stats",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_error() {
        let server = test_server();
        let response = server
            .handle(request("resources/list", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_initialized_notification_has_no_response() {
        let server = test_server();
        let notification: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(server.handle(notification).await.is_none());
        assert!(server.client.lock().unwrap().initialized);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let server = test_server();
        let response = server
            .handle(request(
                "tools/call",
                json!({"name": "no_such_tool", "arguments": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tool_error_uses_envelope_not_protocol_error() {
        // The manager is uninitialized, so the call fails inside the tool
        // and must come back as an isError tool response.
        let server = test_server();
        let response = server
            .handle(request(
                "tools/call",
                json!({"name": "execute_query", "arguments": {"sql": "SELECT 1"}}),
            ))
            .await
            .unwrap();
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Connection not initialized"));
    }

    #[tokio::test]
    async fn test_reset_scrubs_client_state() {
        let server = test_server();
        server
            .handle(request(
                "initialize",
                json!({"clientInfo": {"name": "t"}, "capabilities": {"roots": {}}}),
            ))
            .await;
        server
            .handle(request("logging/setLevel", json!({"level": "debug"})))
            .await;
        {
            let client = server.client.lock().unwrap();
            assert!(client.info.is_some());
            assert!(client.logging_level.is_some());
        }

        server.reset();
        let client = server.client.lock().unwrap();
        assert!(client.info.is_none());
        assert!(client.capabilities.is_none());
        assert!(client.logging_level.is_none());
        assert!(!client.initialized);
    }

    #[tokio::test]
    async fn test_ping() {
        let server = test_server();
        let response = server.handle(request("ping", Value::Null)).await.unwrap();
        assert_eq!(response.result.unwrap(), json!({}));
    }
}
