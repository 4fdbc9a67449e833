//! End-to-end tests driving `router::proxy` against mock upstreams, covering
//! the scenarios from the testable-properties section: cache hit/miss,
//! 5xx failover, all-providers-down, rate limiting, path admission, and
//! circuit-breaker skip-when-open.

use std::sync::Arc;

use apibridge_gateway::budget::BudgetLedger;
use apibridge_gateway::cache::Cache;
use apibridge_gateway::config::{self, GatewayConfig, GatewayMode};
use apibridge_gateway::health::HealthRegistry;
use apibridge_gateway::metrics::GatewayMetrics;
use apibridge_gateway::oauth2::OAuth2TokenCache;
use apibridge_gateway::pii::PiiFirewall;
use apibridge_gateway::rate_limiter::{InMemoryRateLimiter, RateLimiter};
use apibridge_gateway::record_replay::RecordReplay;
use apibridge_gateway::router;
use apibridge_gateway::schema::SchemaRegistry;
use apibridge_gateway::AppState;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use httpmock::prelude::*;
use serde_json::json;

fn build_state(connectors_yaml: &str) -> AppState {
    let policies = config::parse_connectors(connectors_yaml).expect("valid connectors yaml");
    let config = Arc::new(GatewayConfig {
        host: "0.0.0.0".into(),
        port: 0,
        connectors_file: "connectors.yaml".into(),
        redis_url: None,
        mode: GatewayMode::Live,
        auth_enabled: false,
        valid_api_keys: vec![],
        max_request_size_mb: 10,
        allowed_origins: vec![],
        sanitize_logs: true,
        pii_encryption_key: None,
    });
    let http = reqwest::Client::new();
    AppState {
        cache: Arc::new(Cache::new()),
        health: Arc::new(HealthRegistry::new()),
        budget: Arc::new(BudgetLedger::memory_only()),
        oauth2: Arc::new(OAuth2TokenCache::new(http.clone())),
        pii: Arc::new(PiiFirewall::new(None)),
        schema_registry: Arc::new(SchemaRegistry::new()),
        rate_limiter: Arc::new(RateLimiter::Memory(InMemoryRateLimiter::new())),
        metrics: Arc::new(GatewayMetrics::new().unwrap()),
        record_replay: Arc::new(RecordReplay::new(config.mode)),
        policies: Arc::new(policies),
        http,
        config,
    }
}

async fn call(state: &AppState, connector: &str, residual_path: &str, raw_query: &str) -> (StatusCode, HeaderMap<HeaderValue>, Bytes) {
    let result = router::proxy(state, connector, residual_path, Method::GET, HeaderMap::new(), raw_query, Bytes::new()).await;
    let response = match result {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    };
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body)
}

#[tokio::test]
async fn happy_path_get_caches_after_first_upstream_call() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/current.json").query_param("q", "Bogota");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"current": {"temp_c": 25, "humidity": 60}, "location": {"name": "Bogota"}}));
    });

    let yaml = format!(
        "weather_unified:\n  providers:\n    - name: \"provider-A\"\n      base_url: \"{a}\"\n  allow_paths:\n    - \"/current.json\"\n  rate_limit:\n    capacity: 100\n    refill_per_sec: 100\n  cache_ttl_seconds: 60\n  strategy:\n    timeout_ms: 2000\n    retries: 0\n",
        a = server.base_url()
    );
    let state = build_state(&yaml);

    let (status1, headers1, body1) = call(&state, "weather_unified", "current.json", "q=Bogota").await;
    assert_eq!(status1, StatusCode::OK);
    assert_eq!(headers1.get("x-apibridge-cache").unwrap(), "miss");

    let (status2, headers2, body2) = call(&state, "weather_unified", "current.json", "q=Bogota").await;
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(headers2.get("x-apibridge-cache").unwrap(), "hit");
    assert_eq!(body1, body2);

    mock.assert_hits(1);
}

#[tokio::test]
async fn failover_to_second_provider_on_server_error() {
    let server_a = MockServer::start();
    let mock_a = server_a.mock(|when, then| {
        when.method(GET).path("/data");
        then.status(500);
    });
    let server_b = MockServer::start();
    let mock_b = server_b.mock(|when, then| {
        when.method(GET).path("/data");
        then.status(200).header("content-type", "application/json").json_body(json!({"ok": true}));
    });

    let yaml = format!(
        "failover_demo:\n  providers:\n    - name: \"provider-A\"\n      base_url: \"{a}\"\n    - name: \"provider-B\"\n      base_url: \"{b}\"\n  allow_paths:\n    - \"/data\"\n  rate_limit:\n    capacity: 100\n    refill_per_sec: 100\n  cache_ttl_seconds: 0\n  strategy:\n    timeout_ms: 2000\n    retries: 0\n",
        a = server_a.base_url(),
        b = server_b.base_url()
    );
    let state = build_state(&yaml);

    let (status, headers, _body) = call(&state, "failover_demo", "data", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-apibridge-provider").unwrap(), "provider-B");
    mock_a.assert_hits(1);
    mock_b.assert_hits(1);
}

#[tokio::test]
async fn all_providers_failing_returns_502_with_diagnostics() {
    let server_a = MockServer::start();
    let mock_a = server_a.mock(|when, then| {
        when.method(GET).path("/x");
        then.status(503);
    });
    let server_b = MockServer::start();
    let mock_b = server_b.mock(|when, then| {
        when.method(GET).path("/x");
        then.status(503);
    });

    let yaml = format!(
        "down_demo:\n  providers:\n    - name: \"provider-A\"\n      base_url: \"{a}\"\n    - name: \"provider-B\"\n      base_url: \"{b}\"\n  allow_paths:\n    - \"/x\"\n  rate_limit:\n    capacity: 100\n    refill_per_sec: 100\n  cache_ttl_seconds: 0\n  strategy:\n    timeout_ms: 2000\n    retries: 0\n",
        a = server_a.base_url(),
        b = server_b.base_url()
    );
    let state = build_state(&yaml);

    let (status, _headers, body) = call(&state, "down_demo", "x", "").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("provider-A: 503"), "body was: {text}");
    assert!(text.contains("provider-B: 503"), "body was: {text}");
    mock_a.assert_hits(1);
    mock_b.assert_hits(1);
}

#[tokio::test]
async fn rate_limiter_admits_exactly_capacity_requests() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/ping");
        then.status(200).header("content-type", "application/json").json_body(json!({"pong": true}));
    });

    let yaml = format!(
        "limited_demo:\n  providers:\n    - name: \"provider-A\"\n      base_url: \"{a}\"\n  allow_paths:\n    - \"/ping\"\n  rate_limit:\n    capacity: 10\n    refill_per_sec: 0\n  cache_ttl_seconds: 0\n  strategy:\n    timeout_ms: 2000\n    retries: 0\n",
        a = server.base_url()
    );
    let state = build_state(&yaml);

    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..15 {
        let (status, _headers, _body) = call(&state, "limited_demo", "ping", "").await;
        if status == StatusCode::OK {
            ok += 1;
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            limited += 1;
        }
    }
    assert_eq!(ok, 10);
    assert_eq!(limited, 5);
    mock.assert_hits(10);
}

#[tokio::test]
async fn path_admission_allows_normalized_forms_and_rejects_traversal() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/users");
        then.status(200).header("content-type", "application/json").json_body(json!({"users": []}));
    });

    let yaml = format!(
        "users_demo:\n  providers:\n    - name: \"provider-A\"\n      base_url: \"{a}\"\n  allow_paths:\n    - \"/api/users\"\n  rate_limit:\n    capacity: 100\n    refill_per_sec: 100\n  cache_ttl_seconds: 0\n  strategy:\n    timeout_ms: 2000\n    retries: 0\n",
        a = server.base_url()
    );
    let state = build_state(&yaml);

    let (status_ok, _headers, _body) = call(&state, "users_demo", "api/users", "").await;
    assert_eq!(status_ok, StatusCode::OK);

    let (status_encoded, _headers, _body) = call(&state, "users_demo", "%2Fapi%2Fusers", "").await;
    assert_eq!(status_encoded, StatusCode::OK);

    let (status_traversal, _headers, _body) = call(&state, "users_demo", "api/users/../admin", "").await;
    assert_eq!(status_traversal, StatusCode::FORBIDDEN);

    mock.assert_hits(2);
}

#[tokio::test]
async fn circuit_breaker_skips_open_provider_after_threshold_failures() {
    let server_a = MockServer::start();
    let mock_a = server_a.mock(|when, then| {
        when.method(GET).path("/probe");
        then.status(503);
    });
    let server_b = MockServer::start();
    let mock_b = server_b.mock(|when, then| {
        when.method(GET).path("/probe");
        then.status(200).header("content-type", "application/json").json_body(json!({"ok": true}));
    });

    let yaml = format!(
        "breaker_demo:\n  providers:\n    - name: \"provider-A\"\n      base_url: \"{a}\"\n      weight: 1\n    - name: \"provider-B\"\n      base_url: \"{b}\"\n      weight: 1\n  allow_paths:\n    - \"/probe\"\n  rate_limit:\n    capacity: 100\n    refill_per_sec: 100\n  cache_ttl_seconds: 0\n  strategy:\n    timeout_ms: 2000\n    retries: 0\n",
        a = server_a.base_url(),
        b = server_b.base_url()
    );
    let state = build_state(&yaml);

    // Five consecutive failures on provider-A trip its breaker (threshold 5),
    // each followed by a successful failover to provider-B.
    for _ in 0..5 {
        let (status, headers, _body) = call(&state, "breaker_demo", "probe", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-apibridge-provider").unwrap(), "provider-B");
    }
    mock_a.assert_hits(5);
    mock_b.assert_hits(5);

    // The sixth request must skip provider-A entirely (breaker OPEN) rather
    // than attempt and fail it again.
    let (status, headers, _body) = call(&state, "breaker_demo", "probe", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-apibridge-provider").unwrap(), "provider-B");
    mock_a.assert_hits(5);
    mock_b.assert_hits(6);
}
