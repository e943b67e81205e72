pub mod guards;
pub mod oauth;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::{AuthMode, Config, HttpConfig};
use crate::obfuscate::obfuscate;
use crate::protocol::{codes, JsonRpcRequest, JsonRpcResponse};
use crate::services::ConnectionManager;
use crate::tools::ToolRegistry;

use guards::SESSION_ID_HEADER;
use oauth::OAuthVerifier;
use session::{ServerPool, SessionStore};

/// Shared state behind every HTTP handler.
pub struct HttpState {
    pub http_config: HttpConfig,
    pub manager: Arc<ConnectionManager>,
    pub sessions: Arc<SessionStore>,
    pub server_pool: Arc<ServerPool>,
    pub oauth: Option<Arc<OAuthVerifier>>,
}

pub type SharedState = Arc<HttpState>;

/// Serve the streamable HTTP transport until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let manager = Arc::new(ConnectionManager::new(&config));
    let registry = Arc::new(ToolRegistry::new(manager.clone()));

    let shutdown = CancellationToken::new();
    super::spawn_init_retry(manager.clone(), shutdown.clone());

    let http_config = config.http.clone();
    let sessions = Arc::new(SessionStore::new(
        registry.clone(),
        Duration::from_secs(http_config.session_ttl_minutes * 60),
    ));
    if !http_config.stateless {
        sessions.start_sweeper(
            Duration::from_millis(http_config.session_cleanup_interval_ms),
            shutdown.clone(),
        );
    }
    let server_pool = Arc::new(ServerPool::new(
        http_config.server_pool_size,
        registry.clone(),
    ));
    let oauth = match http_config.auth_mode {
        AuthMode::OAuth => {
            let domain = http_config.auth0_domain.clone().unwrap_or_default();
            let audience = http_config.auth0_audience.clone().unwrap_or_default();
            Some(Arc::new(OAuthVerifier::new(domain, audience)))
        }
        AuthMode::None => None,
    };

    let state: SharedState = Arc::new(HttpState {
        http_config: http_config.clone(),
        manager: manager.clone(),
        sessions: sessions.clone(),
        server_pool,
        oauth,
    });

    let app = build_router(state);

    let listener =
        tokio::net::TcpListener::bind((http_config.host.as_str(), http_config.port)).await?;
    log::info!(
        "HTTP transport listening on {}:{} ({} mode, auth: {})",
        http_config.host,
        http_config.port,
        if http_config.stateless { "stateless" } else { "stateful" },
        match http_config.auth_mode {
            AuthMode::OAuth => "oauth",
            AuthMode::None => "none",
        }
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(super::shutdown_signal())
        .await?;

    log::info!("shutting down HTTP transport");
    shutdown.cancel();
    sessions.clear();
    manager.close().await;
    Ok(())
}

pub fn build_router(state: SharedState) -> Router {
    let mcp = Router::new().route(
        "/mcp",
        axum::routing::post(handle_post)
            .get(handle_get)
            .delete(handle_delete),
    );
    let mcp = if state.oauth.is_some() {
        mcp.route_layer(middleware::from_fn_with_state(
            state.clone(),
            oauth::bearer_guard,
        ))
    } else {
        mcp
    };

    let mut router = Router::new()
        .merge(mcp)
        .route("/health", get(health))
        .route("/health/ready", get(health_ready));
    if state.oauth.is_some() {
        router = router
            .route(
                "/.well-known/oauth-protected-resource",
                get(oauth::resource_metadata_handler),
            )
            .route(
                "/mcp/.well-known/oauth-protected-resource",
                get(oauth::resource_metadata_handler),
            );
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            guards::origin_host_guard,
        ))
        .layer(guards::cors_layer(&state.http_config))
        .with_state(state)
}

async fn handle_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return protocol_error(
                StatusCode::BAD_REQUEST,
                codes::PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };

    if state.http_config.stateless {
        handle_post_stateless(state, request).await
    } else {
        handle_post_stateful(state, headers, request).await
    }
}

/// Stateless: borrow a pooled server, serve, scrub, return. No client
/// state outlives the request.
async fn handle_post_stateless(state: SharedState, request: JsonRpcRequest) -> Response {
    let Some(lease) = state.server_pool.acquire().await else {
        return protocol_error(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::SERVER_ERROR,
            "Server pool is shut down",
        );
    };
    match lease.server().handle(request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Stateful: sessions are keyed by the `mcp-session-id` header. The first
/// request must be an initialize, which mints the id.
async fn handle_post_stateful(
    state: SharedState,
    headers: HeaderMap,
    request: JsonRpcRequest,
) -> Response {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok());

    let session = match session_id {
        None => {
            if request.method != "initialize" {
                return protocol_error(
                    StatusCode::BAD_REQUEST,
                    codes::SERVER_ERROR,
                    "Missing mcp-session-id header",
                );
            }
            state.sessions.create()
        }
        Some(id) => match state.sessions.get(id) {
            Some(session) => session,
            None => {
                return protocol_error(
                    StatusCode::NOT_FOUND,
                    codes::SERVER_ERROR,
                    "Unknown session",
                );
            }
        },
    };

    let response = session.server.handle(request).await;
    let mut response = match response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&session.id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

/// Stateful GET opens the server-sent-events channel for a session.
async fn handle_get(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if state.http_config.stateless {
        return method_not_allowed();
    }
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return protocol_error(
            StatusCode::BAD_REQUEST,
            codes::SERVER_ERROR,
            "Missing mcp-session-id header",
        );
    };
    let Some(session) = state.sessions.get(session_id) else {
        return protocol_error(StatusCode::NOT_FOUND, codes::SERVER_ERROR, "Unknown session");
    };

    let stream = BroadcastStream::new(session.notifications.subscribe())
        .filter_map(|message| message.ok())
        .map(|payload| Ok::<Event, std::convert::Infallible>(
            Event::default().event("message").data(payload),
        ));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Stateful DELETE terminates a session immediately.
async fn handle_delete(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if state.http_config.stateless {
        return method_not_allowed();
    }
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return protocol_error(
            StatusCode::BAD_REQUEST,
            codes::SERVER_ERROR,
            "Missing mcp-session-id header",
        );
    };
    if state.sessions.remove(session_id) {
        log::info!("session {session_id} terminated by client");
        Json(json!({})).into_response()
    } else {
        protocol_error(StatusCode::NOT_FOUND, codes::SERVER_ERROR, "Unknown session")
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_ready(State(state): State<SharedState>) -> Response {
    match state.manager.health_check().await {
        Ok(()) => Json(json!({
            "status": "ready",
            "database": "connected",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": obfuscate(&e.to_string()),
            })),
        )
            .into_response(),
    }
}

fn protocol_error(status: StatusCode, code: i64, message: impl Into<String>) -> Response {
    (
        status,
        Json(JsonRpcResponse::error(Value::Null, code, message)),
    )
        .into_response()
}

fn method_not_allowed() -> Response {
    protocol_error(
        StatusCode::METHOD_NOT_ALLOWED,
        codes::SERVER_ERROR,
        "Method not allowed in stateless mode",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;

    fn test_state(extra: &[(&str, &str)]) -> SharedState {
        let mut vars: HashMap<String, String> = [
            ("DATABASE_NAME".to_string(), "appdb".to_string()),
            ("DATABASE_USER".to_string(), "app".to_string()),
        ]
        .into_iter()
        .collect();
        for (key, value) in extra {
            vars.insert(key.to_string(), value.to_string());
        }
        let config = Config::from_map(&vars).unwrap();
        let manager = Arc::new(ConnectionManager::new(&config));
        let registry = Arc::new(ToolRegistry::new(manager.clone()));
        let sessions = Arc::new(SessionStore::new(
            registry.clone(),
            Duration::from_secs(60),
        ));
        let server_pool = Arc::new(ServerPool::new(2, registry.clone()));
        let oauth = match config.http.auth_mode {
            AuthMode::OAuth => Some(Arc::new(OAuthVerifier::new(
                config.http.auth0_domain.clone().unwrap_or_default(),
                config.http.auth0_audience.clone().unwrap_or_default(),
            ))),
            AuthMode::None => None,
        };
        Arc::new(HttpState {
            http_config: config.http,
            manager,
            sessions,
            server_pool,
            oauth,
        })
    }

    fn initialize_request() -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "t", "version": "0"}
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_stateless_initialize_has_no_session_header() {
        let state = test_state(&[]);
        let response = handle_post_stateless(state, initialize_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SESSION_ID_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_stateful_initialize_mints_session_id() {
        let state = test_state(&[("MCP_STATELESS", "false")]);
        let response =
            handle_post_stateful(state.clone(), HeaderMap::new(), initialize_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(state.sessions.get(&session_id).is_some());
    }

    #[tokio::test]
    async fn test_stateful_non_initialize_without_session_is_400() {
        let state = test_state(&[("MCP_STATELESS", "false")]);
        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/list"
        }))
        .unwrap();
        let response = handle_post_stateful(state, HeaderMap::new(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stateful_unknown_session_is_404() {
        let state = test_state(&[("MCP_STATELESS", "false")]);
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("nope"));
        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/list"
        }))
        .unwrap();
        let response = handle_post_stateful(state, headers, request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stateless_get_and_delete_are_405() {
        let state = test_state(&[]);
        let response = handle_get(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let response = handle_delete(State(state), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_stateful_delete_terminates_session() {
        let state = test_state(&[("MCP_STATELESS", "false")]);
        let session = state.sessions.create();
        let mut headers = HeaderMap::new();
        headers.insert(
            SESSION_ID_HEADER,
            HeaderValue::from_str(&session.id).unwrap(),
        );
        let response = handle_delete(State(state.clone()), headers.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.sessions.get(&session.id).is_none());
        let response = handle_delete(State(state), headers).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_shape() {
        let body = health().await.0;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].as_str().is_some());
        assert!(body["version"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_health_ready_without_pool_is_503() {
        let state = test_state(&[]);
        let response = health_ready(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
