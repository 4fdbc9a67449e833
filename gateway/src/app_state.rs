use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;

use crate::budget::BudgetLedger;
use crate::cache::Cache;
use crate::config::{ConnectorPolicy, GatewayConfig};
use crate::health::HealthRegistry;
use crate::metrics::GatewayMetrics;
use crate::oauth2::OAuth2TokenCache;
use crate::pii::PiiFirewall;
use crate::rate_limiter::RateLimiter;
use crate::record_replay::RecordReplay;
use crate::schema::SchemaRegistry;

/// Every collaborator the pipeline needs, built once at startup and shared
/// read-only (or behind its own internal lock) across every request task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub policies: Arc<HashMap<String, ConnectorPolicy>>,
    pub cache: Arc<Cache>,
    pub health: Arc<HealthRegistry>,
    pub budget: Arc<BudgetLedger>,
    pub oauth2: Arc<OAuth2TokenCache>,
    pub pii: Arc<PiiFirewall>,
    pub schema_registry: Arc<SchemaRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<GatewayMetrics>,
    pub http: Client,
    pub record_replay: Arc<RecordReplay>,
}
