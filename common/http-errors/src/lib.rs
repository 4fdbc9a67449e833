use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

/// JSON body returned for every `ApiError`. No stack traces, no internal
/// paths — `message` is meant for operators, not for leaking upstream detail.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The gateway's HTTP-facing error taxonomy. Every variant maps to exactly
/// one status code and one `code` string; both are fixed here so handlers
/// can't drift from the documented contract.
#[derive(Debug)]
pub enum ApiError {
    UnknownConnector { connector: String, trace_id: Option<Uuid> },
    PathNotAllowed { path: String, trace_id: Option<Uuid> },
    RateLimited { retry_after_secs: Option<u64>, trace_id: Option<Uuid> },
    BudgetExceeded { connector: String, trace_id: Option<Uuid> },
    Unauthorized { trace_id: Option<Uuid> },
    Misconfigured { message: String, trace_id: Option<Uuid> },
    AllProvidersFailed { connector: String, errors: Vec<String>, trace_id: Option<Uuid> },
    PayloadTooLarge { max_mb: u64, trace_id: Option<Uuid> },
}

impl ApiError {
    pub fn misconfigured<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self {
        Self::Misconfigured { message: e.to_string(), trace_id }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, trace_id, message) = match self {
            ApiError::UnknownConnector { connector, trace_id } => (
                StatusCode::NOT_FOUND,
                "unknown_connector",
                trace_id,
                Some(format!("no connector named '{connector}'")),
            ),
            ApiError::PathNotAllowed { path, trace_id } => (
                StatusCode::FORBIDDEN,
                "path_not_allowed",
                trace_id,
                Some(format!("path '{path}' is not in this connector's allow list")),
            ),
            ApiError::RateLimited { retry_after_secs, trace_id } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                trace_id,
                retry_after_secs.map(|s| format!("retry after {s}s")),
            ),
            ApiError::BudgetExceeded { connector, trace_id } => (
                StatusCode::PAYMENT_REQUIRED,
                "budget_exceeded",
                trace_id,
                Some(format!("monthly budget for '{connector}' exhausted")),
            ),
            ApiError::Unauthorized { trace_id } => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                trace_id,
                None,
            ),
            ApiError::Misconfigured { message, trace_id } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "misconfigured",
                trace_id,
                Some(message),
            ),
            ApiError::AllProvidersFailed { connector: _, errors, trace_id } => (
                StatusCode::BAD_GATEWAY,
                "all_providers_failed",
                trace_id,
                Some(format!("Upstream error(s): {}", errors.join(", "))),
            ),
            ApiError::PayloadTooLarge { max_mb, trace_id } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                trace_id,
                Some(format!("request body exceeds {max_mb}MB limit")),
            ),
        };
        let body = ErrorBody { code: code.to_string(), trace_id, message };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
