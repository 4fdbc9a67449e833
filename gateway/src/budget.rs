use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

fn month_key(connector: &str, month: &str) -> String {
    format!("budget:{connector}:{month}")
}

pub fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Per-(connector, month) cost accumulator. Mirrors the distributed-limiter
/// degradation rule: a Redis outage falls back to the in-memory map for that
/// call rather than failing the request.
pub struct BudgetLedger {
    redis: Option<ConnectionManager>,
    local: Mutex<HashMap<String, f64>>,
}

impl BudgetLedger {
    pub fn memory_only() -> Self {
        Self { redis: None, local: Mutex::new(HashMap::new()) }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { redis: Some(manager), local: Mutex::new(HashMap::new()) })
    }

    pub async fn add_cost(&self, connector: &str, usd: f64) -> f64 {
        self.add_cost_for_month(connector, usd, &current_month()).await
    }

    pub async fn add_cost_for_month(&self, connector: &str, usd: f64, month: &str) -> f64 {
        let key = month_key(connector, month);
        if let Some(manager) = &self.redis {
            let mut conn = manager.clone();
            match conn.incr::<_, f64, f64>(&key, usd).await {
                Ok(total) => return total,
                Err(err) => warn!(?err, connector, "budget store unreachable, falling back to local ledger"),
            }
        }
        let mut guard = self.local.lock().unwrap();
        let entry = guard.entry(key).or_insert(0.0);
        *entry += usd;
        *entry
    }

    pub async fn get_cost(&self, connector: &str) -> f64 {
        self.get_cost_for_month(connector, &current_month()).await
    }

    pub async fn get_cost_for_month(&self, connector: &str, month: &str) -> f64 {
        let key = month_key(connector, month);
        if let Some(manager) = &self.redis {
            let mut conn = manager.clone();
            match conn.get::<_, Option<f64>>(&key).await {
                Ok(value) => return value.unwrap_or(0.0),
                Err(err) => warn!(?err, connector, "budget store unreachable, falling back to local ledger"),
            }
        }
        *self.local.lock().unwrap().get(&key).unwrap_or(&0.0)
    }
}
