use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "X-Delist-Key";

/// API keys mapped to the seller account they act for.
#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AccountRecord>>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub account_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct AccountRecord {
    account_id: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("DELIST_API_KEYS").unwrap_or_default();
        Self::from_entries(&raw)
    }

    /// Parses `account:key` entries separated by commas.
    pub fn from_entries(raw: &str) -> Self {
        Self {
            records: Arc::new(parse_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            account_id: record.account_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Delist-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "delist.api", "rejected unknown api key");
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, AccountRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let account_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (account_id, key) {
            (Some(account), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    AccountRecord {
                        account_id: account.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "delist.api",
                "ignored malformed DELIST_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "delist.api",
            "DELIST_API_KEYS produced no keys; every protected route will answer 401"
        );
    } else {
        info!(
            target = "delist.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn keys_resolve_to_accounts() {
        let state = AuthState::from_entries("seller-1:k1, seller-2:k2,broken, :k3");
        let ctx = state.authenticate("k2").expect("known key");
        assert_eq!(ctx.account_id, "seller-2");
        assert_eq!(ctx.api_key_id, "key-02");
        assert!(state.authenticate("k3").is_none());
        assert!(state.authenticate("broken").is_none());
    }

    #[test]
    fn bearer_takes_precedence_over_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-header"));

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn blank_header_is_missing() {
        let mut headers = http::HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("  "));
        assert_eq!(extract_api_key(&headers), None);
    }
}
