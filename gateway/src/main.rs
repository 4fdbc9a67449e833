use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::{middleware, Router};
use clap::Parser;
use common_http_errors::ApiError;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use apibridge_gateway::app_state::AppState;
use apibridge_gateway::budget::BudgetLedger;
use apibridge_gateway::cache::Cache;
use apibridge_gateway::config::{self, GatewayConfig, GatewayMode};
use apibridge_gateway::health::HealthRegistry;
use apibridge_gateway::ingress_auth::require_api_key;
use apibridge_gateway::logging;
use apibridge_gateway::metrics::GatewayMetrics;
use apibridge_gateway::oauth2::OAuth2TokenCache;
use apibridge_gateway::pii::PiiFirewall;
use apibridge_gateway::rate_limiter::{InMemoryRateLimiter, RateLimiter, RedisRateLimiter};
use apibridge_gateway::record_replay::RecordReplay;
use apibridge_gateway::router;
use apibridge_gateway::schema::SchemaRegistry;
use apibridge_gateway::tracing_span::traced;

/// Recognized environment variables are documented in `--help`; every flag
/// here mirrors one so the binary is usable with either surface.
#[derive(Parser, Debug)]
#[command(name = "apibridge-gateway", about = "Policy-driven HTTP API gateway")]
struct Cli {
    /// Bind host. Overrides HOST.
    #[arg(long)]
    host: Option<String>,
    /// Bind port. Overrides PORT.
    #[arg(long)]
    port: Option<u16>,
    /// Connector policy file. Overrides CONNECTORS_FILE.
    #[arg(long = "connectors-file")]
    connectors_file: Option<String>,
    /// Accepted for compatibility; this is not a dev-reload server.
    #[arg(long = "no-reload")]
    no_reload: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = cli.no_reload;
    logging::init();

    let mut config = GatewayConfig::from_env()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(file) = cli.connectors_file {
        config.connectors_file = file;
    }
    let config = Arc::new(config);

    let policies = Arc::new(config::load_config(&config.connectors_file)?);
    info!(connectors = policies.len(), mode = config.mode.as_str(), "loaded connector policies");

    let http = reqwest::Client::builder().build()?;

    let rate_limiter = match &config.redis_url {
        Some(url) => RateLimiter::Redis(RedisRateLimiter::new(url, "apibridge").await?),
        None => RateLimiter::Memory(InMemoryRateLimiter::new()),
    };

    let budget = match &config.redis_url {
        Some(url) => BudgetLedger::connect(url).await?,
        None => BudgetLedger::memory_only(),
    };

    let state = AppState {
        cache: Arc::new(Cache::new()),
        health: Arc::new(HealthRegistry::new()),
        budget: Arc::new(budget),
        oauth2: Arc::new(OAuth2TokenCache::new(http.clone())),
        pii: Arc::new(PiiFirewall::new(config.pii_encryption_key.as_deref())),
        schema_registry: Arc::new(SchemaRegistry::new()),
        rate_limiter: Arc::new(rate_limiter),
        metrics: Arc::new(GatewayMetrics::new()?),
        record_replay: Arc::new(RecordReplay::new(config.mode)),
        policies,
        http,
        config: config.clone(),
    };

    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };

    let proxied = Router::new()
        .route("/proxy/:connector/*residual_path", any(proxy_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/status", get(admin_status_handler))
        .merge(proxied)
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    info!(%addr, "apibridge gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connectors: Vec<&String> = state.policies.keys().collect();
    Json(json!({"ok": true, "mode": state.config.mode.as_str(), "connectors": connectors}))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render())
}

async fn admin_status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut connectors = serde_json::Map::new();
    for (name, policy) in state.policies.iter() {
        let providers: Vec<serde_json::Value> = policy
            .providers
            .iter()
            .map(|p| json!({"name": p.name, "healthy": state.health.is_healthy(&p.key)}))
            .collect();
        let spend = state.budget.get_cost(name).await;
        connectors.insert(
            name.clone(),
            json!({
                "providers": providers,
                "cache_ttl_seconds": policy.cache_ttl_seconds,
                "monthly_spend_usd": spend,
            }),
        );
    }
    Json(json!({"mode": state.config.mode.as_str(), "connectors": connectors}))
}

async fn proxy_handler(
    State(state): State<AppState>,
    Path((connector, residual_path)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let max_bytes = state.config.max_request_size_mb * 1024 * 1024;
    if body.len() as u64 > max_bytes {
        return Err(ApiError::PayloadTooLarge { max_mb: state.config.max_request_size_mb, trace_id: None });
    }

    let raw_query = raw_query.unwrap_or_default();
    let rr_key = RecordReplay::key(method.as_str(), &connector, &residual_path, &raw_query);

    if let Some(captured) = state.record_replay.lookup(&rr_key) {
        let status = StatusCode::from_u16(captured.status).unwrap_or(StatusCode::OK);
        return Ok((status, Json(captured.body)).into_response());
    }

    let response = traced(
        "gateway.proxy",
        router::proxy(&state, &connector, &residual_path, method.clone(), headers, &raw_query, body),
    )
    .await?;

    if state.record_replay.mode() == GatewayMode::Record && response.status().is_success() {
        let status = response.status();
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            state.record_replay.capture(rr_key, status.as_u16(), value);
        }
        return Ok(Response::from_parts(parts, axum::body::Body::from(bytes)));
    }

    Ok(response)
}
