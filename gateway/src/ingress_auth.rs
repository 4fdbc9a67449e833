use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use common_http_errors::ApiError;

use crate::app_state::AppState;

/// Gate in front of `/proxy/*`, active only when `config.auth_enabled`.
/// Validates `X-API-Key` (or `Authorization: Bearer <key>`) against the set
/// loaded from `VALID_API_KEYS`. A completely different concern from the
/// per-connector `AuthSpec` (egress auth to upstream providers) — this is
/// ingress auth to this service itself.
pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ApiError> {
    if !state.config.auth_enabled {
        return Ok(next.run(request).await);
    }

    let supplied = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|s| s.to_string())
        });

    match supplied {
        Some(key) if state.config.valid_api_keys.iter().any(|k| k == &key) => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized { trace_id: None }),
    }
}
