use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use serde_json::Value;

use crate::app_state::AppState;
use crate::budget::current_month;
use crate::cache;
use crate::config::{self, AuthSpec, ConnectorPolicy, OnExceed, Provider};
use crate::pii::PiiAction;
use crate::transform::{apply_transform, TransformContext};

struct AttemptSuccess {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    latency_ms: i64,
}

struct AttemptFailure {
    retryable: bool,
    message: String,
}

/// Mutates `headers`/`query` in place per the precedence rule: the policy's
/// `auth` wins over the provider's own `auth`; whichever is chosen is
/// applied before `static_headers`/`static_params` are merged in by the
/// caller.
async fn apply_auth(
    state: &AppState,
    auth: Option<&AuthSpec>,
    provider_key: &str,
    headers: &mut HeaderMap,
    query: &mut Vec<(String, String)>,
) -> Result<(), String> {
    let Some(auth) = auth else { return Ok(()) };
    match auth {
        AuthSpec::ApiKeyHeader { name, value } => {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
            let header_value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
            headers.insert(header_name, header_value);
        }
        AuthSpec::ApiKeyQuery { name, value } => {
            query.push((name.clone(), value.clone()));
        }
        AuthSpec::Bearer { token } => {
            let header_value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| e.to_string())?;
            headers.insert(header::AUTHORIZATION, header_value);
        }
        AuthSpec::Oauth2ClientCredentials { token_url, client_id, client_secret, scope, extra_params } => {
            let token = state
                .oauth2
                .get_token(provider_key, token_url, client_id, client_secret, scope.as_deref(), extra_params)
                .await
                .map_err(|e| e.to_string())?;
            let header_value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| e.to_string())?;
            headers.insert(header::AUTHORIZATION, header_value);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn execute_attempt(
    state: &AppState,
    policy: &ConnectorPolicy,
    provider: &Provider,
    normalized_path: &str,
    method: &Method,
    inbound_headers: &HeaderMap,
    raw_query: &str,
    body: Bytes,
) -> Result<AttemptSuccess, AttemptFailure> {
    let mut headers = inbound_headers.clone();
    let mut query: Vec<(String, String)> = Vec::new();

    let auth = policy.auth.as_ref().or(provider.auth.as_ref());
    if let Err(message) = apply_auth(state, auth, &provider.key, &mut headers, &mut query).await {
        return Err(AttemptFailure { retryable: false, message });
    }
    for (name, value) in &policy.static_headers {
        if let (Ok(header_name), Ok(header_value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(header_name, header_value);
        }
    }
    for (name, value) in &policy.static_params {
        query.push((name.clone(), value.clone()));
    }

    let query_suffix = if raw_query.is_empty() { String::new() } else { format!("?{raw_query}") };
    let url = format!("{}{}{}", provider.base_url.trim_end_matches('/'), normalized_path, query_suffix);

    if tracing::enabled!(tracing::Level::DEBUG) {
        let loggable: Vec<(String, String)> = headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();
        let redacted = crate::logging::redact_headers(&loggable, state.config.sanitize_logs);
        tracing::debug!(provider = %provider.name, url, headers = ?redacted, "dispatching upstream request");
    }

    let start = Instant::now();
    let result = state
        .http
        .request(method.clone(), url.as_str())
        .headers(headers)
        .query(&query)
        .timeout(Duration::from_millis(policy.strategy.timeout_ms))
        .body(body)
        .send()
        .await;
    let latency_ms = start.elapsed().as_millis() as i64;

    match result {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                let upstream_headers = response.headers().clone();
                let body = response.bytes().await.unwrap_or_default();
                Ok(AttemptSuccess { status, headers: upstream_headers, body, latency_ms })
            } else if status.is_server_error() {
                Err(AttemptFailure { retryable: true, message: status.as_u16().to_string() })
            } else {
                Err(AttemptFailure { retryable: false, message: status.as_u16().to_string() })
            }
        }
        Err(err) => Err(AttemptFailure { retryable: true, message: err.to_string() }),
    }
}

/// The main state machine: resolve → admit → rate-limit → snapshot →
/// select candidates → cache probe → provider/retry loop → success
/// processing → final failure. Step order is normative; no state written
/// in a later step is observable to an earlier one within the same call.
pub async fn proxy(
    state: &AppState,
    connector: &str,
    residual_path: &str,
    method: Method,
    headers: HeaderMap,
    raw_query: &str,
    body: Bytes,
) -> Result<Response, ApiError> {
    let overall_start = Instant::now();

    let policy = state
        .policies
        .get(connector)
        .ok_or_else(|| ApiError::UnknownConnector { connector: connector.to_string(), trace_id: None })?;

    let check_path = format!("/{residual_path}");
    if !policy.path_allowed(&check_path) {
        return Err(ApiError::PathNotAllowed { path: check_path, trace_id: None });
    }
    let normalized_path = config::normalize_path(&check_path);

    let rl_name = format!("rl:{connector}");
    if !state.rate_limiter.allow(&rl_name, policy.rate_limit.capacity, policy.rate_limit.refill_per_sec).await {
        state.metrics.record_rate_limit(connector);
        return Err(ApiError::RateLimited { retry_after_secs: None, trace_id: None });
    }

    let mut inbound_headers = headers;
    inbound_headers.remove(header::HOST);
    inbound_headers.remove(header::CONTENT_LENGTH);

    let candidates: Vec<Provider> = if !policy.providers.is_empty() {
        state.health.pick_best(&policy.providers)
    } else if let Some(base_url) = &policy.base_url {
        vec![Provider { name: "default".to_string(), base_url: base_url.clone(), weight: 1, auth: None, key: format!("{connector}:default") }]
    } else {
        return Err(ApiError::Misconfigured {
            message: format!("connector '{connector}' has neither providers nor base_url"),
            trace_id: None,
        });
    };

    let is_get = method == Method::GET;
    let cache_key_value = if is_get && policy.cache_ttl_seconds > 0 {
        Some(cache::cache_key(connector, method.as_str(), &candidates[0].base_url, &normalized_path, raw_query))
    } else {
        None
    };

    if let Some(key) = &cache_key_value {
        if let Some(entry) = state.cache.get(key) {
            state.metrics.record_cache_hit(connector);
            state.metrics.record_request(connector, method.as_str(), entry.status, overall_start.elapsed().as_secs_f64());
            let mut response_headers = HeaderMap::new();
            for (name, value) in &entry.headers {
                if let (Ok(header_name), Ok(header_value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    response_headers.append(header_name, header_value);
                }
            }
            response_headers.insert("x-apibridge-cache", HeaderValue::from_static("hit"));
            let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
            return Ok((status, response_headers, entry.body.clone()).into_response());
        }
        state.metrics.record_cache_miss(connector);
    }

    let mut errors: Vec<String> = Vec::new();
    let mut success: Option<(Provider, AttemptSuccess)> = None;

    'candidates: for provider in &candidates {
        let total_attempts = policy.strategy.retries + 1;
        for attempt in 0..total_attempts {
            let outcome = execute_attempt(
                state,
                policy,
                provider,
                &normalized_path,
                &method,
                &inbound_headers,
                raw_query,
                body.clone(),
            )
            .await;
            match outcome {
                Ok(attempt_success) => {
                    let status = attempt_success.status.as_u16().to_string();
                    state.metrics.record_upstream(connector, &provider.name, &status, attempt_success.latency_ms as f64 / 1000.0);
                    success = Some((provider.clone(), attempt_success));
                    break 'candidates;
                }
                Err(failure) => {
                    if failure.retryable && attempt + 1 < total_attempts {
                        continue;
                    }
                    let status_label = if failure.message.chars().all(|c| c.is_ascii_digit()) { failure.message.as_str() } else { "error" };
                    state.metrics.record_upstream(connector, &provider.name, status_label, 0.0);
                    state.health.mark_failure(&provider.key);
                    state.metrics.update_provider_health(connector, &provider.name, false);
                    errors.push(format!("{}: {}", provider.name, failure.message));
                    break;
                }
            }
        }
    }

    let Some((provider, attempt)) = success else {
        tracing::warn!(connector, errors = %errors.join(", "), "all upstream providers failed");
        return Err(ApiError::AllProvidersFailed { connector: connector.to_string(), errors, trace_id: None });
    };

    state.health.mark_success(&provider.key, attempt.latency_ms);
    state.metrics.update_provider_health(connector, &provider.name, true);

    let mut response_headers = HeaderMap::new();
    for (name, value) in attempt.headers.iter() {
        if policy.passthrough_headers.iter().any(|h| h.eq_ignore_ascii_case(name.as_str())) {
            response_headers.append(name.clone(), value.clone());
        }
    }

    let content_type = attempt.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    let mut final_body_bytes = attempt.body.to_vec();
    let mut drift_msg: Option<String> = None;

    if content_type.starts_with("application/json") {
        if let Ok(parsed) = serde_json::from_slice::<Value>(&attempt.body) {
            let meta = TransformContext { provider: provider.name.clone(), status: attempt.status.as_u16(), latency_ms: attempt.latency_ms };
            let mut data = apply_transform(&parsed, policy.transforms.as_ref().and_then(|t| t.response.as_deref()), &meta);

            if let Some(pii_cfg) = &policy.pii_protection {
                if pii_cfg.enabled {
                    if pii_cfg.auto_scan {
                        if let Some(action) = pii_cfg.action.as_deref().and_then(PiiAction::parse) {
                            data = state.pii.auto_scan(data, action);
                        }
                    } else if !pii_cfg.field_rules.is_empty() {
                        data = state.pii.process_dict(data, &pii_cfg.field_rules);
                    }
                }
            }

            if let Some(model) = &policy.response_model {
                if let Some(msg) = state.schema_registry.check(model, &data) {
                    state.metrics.record_schema_drift(connector);
                    drift_msg = Some(msg);
                }
            }

            final_body_bytes = serde_json::to_vec(&data).unwrap_or(final_body_bytes);
            response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
    }

    if policy.cost_per_call_usd > 0.0 {
        let spent = state.budget.add_cost(connector, policy.cost_per_call_usd).await;
        if let Some(budget_spec) = &policy.budget {
            state.metrics.update_budget(connector, &current_month(), spent);
            if spent > budget_spec.monthly_usd_max {
                match budget_spec.on_exceed {
                    OnExceed::Block => {
                        return Err(ApiError::BudgetExceeded { connector: connector.to_string(), trace_id: None });
                    }
                    OnExceed::DowngradeProvider => {
                        if let Ok(value) = HeaderValue::from_str(&format!("exceeded:{spent:.2}")) {
                            response_headers.insert("x-apibridge-budget", value);
                        }
                    }
                }
            }
        }
    }

    if let Some(key) = cache_key_value {
        let stored_headers: Vec<(String, String)> = response_headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();
        state.cache.set(key, final_body_bytes.clone(), stored_headers, attempt.status.as_u16(), policy.cache_ttl_seconds);
    }

    response_headers.insert("x-apibridge-provider", HeaderValue::from_str(&provider.name).unwrap_or(HeaderValue::from_static("unknown")));
    response_headers.insert("x-apibridge-latency-ms", HeaderValue::from_str(&attempt.latency_ms.to_string()).unwrap_or(HeaderValue::from_static("0")));
    response_headers.insert("x-apibridge-cache", HeaderValue::from_static("miss"));
    if let Some(msg) = drift_msg {
        response_headers.insert("x-apibridge-drift", HeaderValue::from_static("1"));
        if let Ok(value) = HeaderValue::from_str(&msg) {
            response_headers.insert("x-apibridge-drift-msg", value);
        }
    }

    state.metrics.record_request(connector, method.as_str(), attempt.status.as_u16(), overall_start.elapsed().as_secs_f64());

    Ok((attempt.status, response_headers, final_body_bytes).into_response())
}
