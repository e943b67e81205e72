use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::protocol::{codes, JsonRpcResponse};

use super::SharedState;

/// Verified bearer token claims, attached to the request for handlers that
/// want them.
#[derive(Clone)]
pub struct OAuthClaims(pub Value);

#[derive(Deserialize)]
struct JwksDocument {
    keys: Vec<JwkEntry>,
}

#[derive(Deserialize)]
struct JwkEntry {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

struct CachedKey {
    kid: Option<String>,
    key: DecodingKey,
}

/// RS256 JWT verification against a tenant's JWKS. The key set is fetched
/// once per process lifetime and cached for the verifier's domain.
pub struct OAuthVerifier {
    domain: String,
    audience: String,
    http: reqwest::Client,
    keys: RwLock<Option<Arc<Vec<CachedKey>>>>,
}

impl OAuthVerifier {
    pub fn new(domain: String, audience: String) -> Self {
        OAuthVerifier {
            domain,
            audience,
            http: reqwest::Client::new(),
            keys: RwLock::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    async fn keys(&self) -> Result<Arc<Vec<CachedKey>>, String> {
        if let Some(keys) = self.keys.read().await.clone() {
            return Ok(keys);
        }

        let url = format!("https://{}/.well-known/jwks.json", self.domain);
        let document: JwksDocument = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("JWKS fetch failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("JWKS fetch failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("JWKS parse failed: {e}"))?;

        let mut keys = Vec::new();
        for entry in document.keys {
            if entry.kty != "RSA" {
                continue;
            }
            let (Some(n), Some(e)) = (&entry.n, &entry.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => keys.push(CachedKey {
                    kid: entry.kid,
                    key,
                }),
                Err(e) => log::warn!("skipping unusable JWKS key: {e}"),
            }
        }
        if keys.is_empty() {
            return Err("JWKS contained no usable RSA keys".to_string());
        }

        let keys = Arc::new(keys);
        *self.keys.write().await = Some(keys.clone());
        Ok(keys)
    }

    /// Verify signature, issuer, audience, and expiry. Returns the claims.
    pub async fn verify(&self, token: &str) -> Result<Value, String> {
        let header = decode_header(token).map_err(|e| e.to_string())?;
        let keys = self.keys().await?;

        let key = match &header.kid {
            Some(kid) => keys
                .iter()
                .find(|candidate| candidate.kid.as_deref() == Some(kid.as_str())),
            None => keys.first(),
        }
        .ok_or_else(|| "no matching signing key".to_string())?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.clone()]);
        validation.set_issuer(&[format!("https://{}/", self.domain)]);

        decode::<Value>(token, &key.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| e.to_string())
    }
}

/// Build the challenge header pointing browsers at the resource metadata.
pub fn www_authenticate(host: &str) -> String {
    format!(
        "Bearer realm=\"mcp\", \
         resource_metadata=\"https://{host}/.well-known/oauth-protected-resource\", \
         scope=\"openid profile email\""
    )
}

/// Bearer-token middleware for `/mcp`. Runs only when oauth mode is on.
pub async fn bearer_guard(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(verifier) = state.oauth.clone() else {
        return next.run(request).await;
    };

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost")
        .to_string();

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    let Some(token) = token else {
        return unauthorized(&host, "Missing bearer token");
    };

    match verifier.verify(token).await {
        Ok(claims) => {
            request.extensions_mut().insert(OAuthClaims(claims));
            next.run(request).await
        }
        Err(reason) => {
            log::debug!("token rejected: {reason}");
            unauthorized(&host, "Invalid or expired token")
        }
    }
}

fn unauthorized(host: &str, message: &str) -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(JsonRpcResponse::error(
            Value::Null,
            codes::UNAUTHORIZED,
            message,
        )),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&www_authenticate(host)) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// OAuth protected-resource metadata document.
pub async fn resource_metadata_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Json<Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let domain = state
        .oauth
        .as_ref()
        .map(|verifier| verifier.domain().to_string())
        .unwrap_or_default();

    let mut document = json!({
        "resource": format!("https://{host}/mcp"),
        "authorization_servers": [format!("https://{domain}/")],
        "scopes_supported": ["openid", "profile", "email"],
        "bearer_methods_supported": ["header"],
    });
    if let Some(docs_url) = &state.http_config.resource_documentation {
        document["resource_documentation"] = Value::String(docs_url.clone());
    }
    Json(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_www_authenticate_header() {
        let value = www_authenticate("mcp.example.com");
        assert!(value.starts_with("Bearer realm=\"mcp\""));
        assert!(value.contains(
            "resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
        ));
        assert!(value.contains("scope=\"openid profile email\""));
    }

    #[tokio::test]
    async fn test_verify_rejects_garbage_token() {
        let verifier = OAuthVerifier::new(
            "tenant.auth0.com".to_string(),
            "https://api.example".to_string(),
        );
        assert!(verifier.verify("not-a-jwt").await.is_err());
    }
}
