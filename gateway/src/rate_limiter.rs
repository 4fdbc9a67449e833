use crate::token_bucket::TokenBucket;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// A rate-limiting backend. Implementations never return an error to the
/// caller — a store outage degrades to "allow locally" rather than aborting
/// the request, per the distributed-limiter fallback rule.
#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn allow(&self, name: &str, capacity: f64, refill_per_sec: f64) -> bool;
}

/// Process-local token buckets, one per rate-limit name.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self { buckets: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn allow(&self, name: &str, capacity: f64, refill_per_sec: f64) -> bool {
        let mut guard = self.buckets.lock().await;
        let bucket = guard
            .entry(name.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, refill_per_sec));
        bucket.allow()
    }
}

/// Shared token bucket stored as a Redis hash `rl:<name>` with fields
/// `tokens`, `last`, `capacity`, `refill`. The read-modify-write spans two
/// round trips and is not atomic across replicas; any Redis error for any
/// step falls back to the in-memory bucket for that single call.
#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    prefix: String,
    fallback: InMemoryRateLimiter,
}

impl RedisRateLimiter {
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager, prefix: prefix.into(), fallback: InMemoryRateLimiter::new() })
    }

    async fn try_allow(&self, name: &str, capacity: f64, refill_per_sec: f64) -> redis::RedisResult<bool> {
        let key = format!("{}:rl:{}", self.prefix, name);
        let mut conn = self.manager.clone();
        let now = now_unix();

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        let stored_capacity: f64 = fields.get("capacity").and_then(|v| v.parse().ok()).unwrap_or(capacity);
        let stored_refill: f64 = fields.get("refill").and_then(|v| v.parse().ok()).unwrap_or(refill_per_sec);
        let mut tokens: f64 = fields.get("tokens").and_then(|v| v.parse().ok()).unwrap_or(capacity);
        let last: f64 = fields.get("last").and_then(|v| v.parse().ok()).unwrap_or(now);

        let elapsed = (now - last).max(0.0);
        tokens = (tokens + elapsed * stored_refill.max(0.0)).min(stored_capacity.max(capacity));
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("tokens", tokens.to_string()),
                    ("last", now.to_string()),
                    ("capacity", capacity.to_string()),
                    ("refill", refill_per_sec.to_string()),
                ],
            )
            .await?;
        let _: () = conn.expire(&key, 3600).await?;
        Ok(allowed)
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn allow(&self, name: &str, capacity: f64, refill_per_sec: f64) -> bool {
        match self.try_allow(name, capacity, refill_per_sec).await {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(?err, name, "distributed rate limiter unreachable, falling back to local bucket");
                self.fallback.allow(name, capacity, refill_per_sec).await
            }
        }
    }
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Dispatches to whichever backend was constructed at startup; the pipeline
/// never branches on "redis or not", per the design notes.
#[derive(Clone)]
pub enum RateLimiter {
    Redis(RedisRateLimiter),
    Memory(InMemoryRateLimiter),
}

impl RateLimiter {
    pub async fn allow(&self, name: &str, capacity: f64, refill_per_sec: f64) -> bool {
        match self {
            RateLimiter::Redis(r) => r.allow(name, capacity, refill_per_sec).await,
            RateLimiter::Memory(r) => r.allow(name, capacity, refill_per_sec).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_limiter_caps_at_capacity() {
        let limiter = InMemoryRateLimiter::new();
        let mut successes = 0;
        for _ in 0..15 {
            if limiter.allow("conn:test", 10.0, 0.0).await {
                successes += 1;
            }
        }
        assert_eq!(successes, 10);
    }

    #[tokio::test]
    async fn distinct_names_are_independent() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.allow("a", 5.0, 0.0).await);
        }
        assert!(limiter.allow("b", 5.0, 0.0).await);
    }
}
