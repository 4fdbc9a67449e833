pub mod app_state;
pub mod budget;
pub mod cache;
pub mod config;
pub mod health;
pub mod ingress_auth;
pub mod logging;
pub mod metrics;
pub mod oauth2;
pub mod pii;
pub mod rate_limiter;
pub mod record_replay;
pub mod router;
pub mod schema;
pub mod token_bucket;
pub mod transform;
pub mod tracing_span;

pub use crate::app_state::AppState;
pub use crate::config::{GatewayConfig, GatewayMode};
pub use crate::metrics::GatewayMetrics;
pub use crate::rate_limiter::RateLimiter;
pub use crate::router::proxy;
