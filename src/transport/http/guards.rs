use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::config::HttpConfig;
use crate::protocol::{codes, JsonRpcResponse};

use super::SharedState;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Standard CORS layer: exposes the session id header to browsers and
/// preflights the headers the protocol uses.
pub fn cors_layer(config: &HttpConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(SESSION_ID_HEADER),
            header::ACCEPT,
        ])
        .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)]);

    if accepts_any_origin(&config.allowed_origins) {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| normalize_origin(origin).parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

/// Reject disallowed `Origin` headers (403) and, when an allow-list is
/// configured, unexpected `Host` headers (DNS rebinding defence).
pub async fn origin_host_guard(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let config = &state.http_config;

    if !config.allowed_hosts.is_empty() {
        let host = header_str(&request, header::HOST);
        let allowed = host
            .map(|host| {
                config
                    .allowed_hosts
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(host))
            })
            .unwrap_or(false);
        if !allowed {
            return rejection("Host not allowed");
        }
    }

    if !accepts_any_origin(&config.allowed_origins) {
        if let Some(origin) = header_str(&request, header::ORIGIN) {
            let normalized = normalize_origin(origin);
            let allowed = config
                .allowed_origins
                .iter()
                .any(|candidate| normalize_origin(candidate) == normalized);
            if !allowed {
                return rejection("Origin not allowed");
            }
        }
    }

    next.run(request).await
}

fn header_str(request: &Request, name: header::HeaderName) -> Option<&str> {
    request.headers().get(name).and_then(|value| value.to_str().ok())
}

fn rejection(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(JsonRpcResponse::error(
            Value::Null,
            codes::SERVER_ERROR,
            message,
        )),
    )
        .into_response()
}

pub fn accepts_any_origin(allowed_origins: &[String]) -> bool {
    allowed_origins.is_empty() || allowed_origins.iter().any(|origin| origin == "*")
}

/// Lowercase, no trailing slash.
pub fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_origin() {
        assert_eq!(normalize_origin("https://App.Example/"), "https://app.example");
        assert_eq!(normalize_origin(" https://a.example "), "https://a.example");
        assert_eq!(normalize_origin("https://a.example"), "https://a.example");
    }

    #[test]
    fn test_accepts_any_origin() {
        assert!(accepts_any_origin(&[]));
        assert!(accepts_any_origin(&["*".to_string()]));
        assert!(!accepts_any_origin(&["https://a.example".to_string()]));
    }
}
