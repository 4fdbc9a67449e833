use crate::config::Provider;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const FAILURE_THRESHOLD: u32 = 5;
const RECOVERY_TIMEOUT_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-provider failure/recovery state machine. Transitions follow the
/// table in the component design exactly: N consecutive failures trip the
/// breaker; it half-opens after the recovery timeout and one probing
/// success closes it again.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_s: f64,
    pub last_failure_ts: f64,
    pub last_success_ts: f64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            failure_threshold: FAILURE_THRESHOLD,
            recovery_timeout_s: RECOVERY_TIMEOUT_SECS,
            last_failure_ts: 0.0,
            last_success_ts: 0.0,
        }
    }
}

impl CircuitBreaker {
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_success_ts = now_unix();
    }

    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.last_failure_ts = now_unix();
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.failure_count = self.failure_threshold.max(self.failure_count);
                self.last_failure_ts = now_unix();
            }
            BreakerState::Open => {
                self.last_failure_ts = now_unix();
            }
        }
    }

    pub fn should_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now_unix() - self.last_failure_ts > self.recovery_timeout_s {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }
}

fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Per-`__key` health: whether the provider is currently considered healthy,
/// its EMA latency, and its breaker.
#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub healthy: bool,
    pub avg_latency_ms: i64,
    pub last_ts: f64,
    pub breaker: CircuitBreaker,
}

impl Default for HealthEntry {
    fn default() -> Self {
        Self { healthy: true, avg_latency_ms: 9999, last_ts: 0.0, breaker: CircuitBreaker::default() }
    }
}

/// Tracks one `HealthEntry` per provider `__key`, guarded by a single mutex
/// covering read-modify-write of any one entry.
pub struct HealthRegistry {
    entries: Mutex<HashMap<String, HealthEntry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn mark_success(&self, key: &str, latency_ms: i64) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        entry.avg_latency_ms = if entry.last_ts == 0.0 {
            latency_ms
        } else {
            (0.7 * entry.avg_latency_ms as f64 + 0.3 * latency_ms as f64).round() as i64
        };
        entry.healthy = true;
        entry.last_ts = now_unix();
        entry.breaker.record_success();
    }

    pub fn mark_failure(&self, key: &str) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        entry.healthy = false;
        entry.last_ts = now_unix();
        entry.breaker.record_failure();
    }

    pub fn should_attempt(&self, key: &str) -> bool {
        let mut guard = self.entries.lock().unwrap();
        match guard.get_mut(key) {
            Some(entry) => entry.breaker.should_attempt(),
            None => true,
        }
    }

    pub fn is_healthy(&self, key: &str) -> bool {
        self.entries.lock().unwrap().get(key).map(|e| e.healthy).unwrap_or(true)
    }

    fn circuit_penalty(&self, key: &str) -> i64 {
        match self.entries.lock().unwrap().get(key).map(|e| e.breaker.state) {
            Some(BreakerState::Closed) | None => 0,
            Some(BreakerState::HalfOpen) => 50_000,
            Some(BreakerState::Open) => 100_000,
        }
    }

    fn avg_latency_ms(&self, key: &str) -> i64 {
        self.entries.lock().unwrap().get(key).map(|e| e.avg_latency_ms).unwrap_or(9999)
    }

    /// Ranks candidates: unattemptable providers are filtered out unless
    /// that would empty the list (then the original order is returned,
    /// allowing half-open probing); survivors are sorted healthy-first,
    /// then by ascending `circuit_penalty + avg_latency_ms - weight*10`.
    pub fn pick_best(&self, providers: &[Provider]) -> Vec<Provider> {
        let attemptable: Vec<Provider> = providers
            .iter()
            .filter(|p| self.should_attempt(&p.key))
            .cloned()
            .collect();
        let mut candidates = if attemptable.is_empty() { providers.to_vec() } else { attemptable };

        candidates.sort_by_key(|p| {
            let healthy = self.is_healthy(&p.key);
            let penalty = self.circuit_penalty(&p.key);
            let latency = self.avg_latency_ms(&p.key);
            let score = penalty + latency - (p.weight as i64) * 10;
            (if healthy { 0i64 } else { 1i64 }, score)
        });
        candidates
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, weight: i64) -> Provider {
        Provider {
            name: name.to_string(),
            base_url: format!("https://{name}.example"),
            weight,
            auth: None,
            key: format!("conn:{name}"),
        }
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state, BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state, BreakerState::Open);
    }

    #[test]
    fn half_open_success_resets_to_closed() {
        let mut breaker = CircuitBreaker::default();
        breaker.state = BreakerState::HalfOpen;
        breaker.failure_count = 5;
        breaker.record_success();
        assert_eq!(breaker.state, BreakerState::Closed);
        assert_eq!(breaker.failure_count, 0);
    }

    #[test]
    fn open_blocks_attempts_until_recovery_timeout() {
        let mut breaker = CircuitBreaker::default();
        breaker.state = BreakerState::Open;
        breaker.recovery_timeout_s = 0.0;
        breaker.last_failure_ts = now_unix() - 1.0;
        assert!(breaker.should_attempt());
        assert_eq!(breaker.state, BreakerState::HalfOpen);
    }

    #[test]
    fn ema_seeds_with_first_sample() {
        let registry = HealthRegistry::new();
        registry.mark_success("conn:a", 120);
        assert_eq!(registry.avg_latency_ms("conn:a"), 120);
        registry.mark_success("conn:a", 20);
        assert_eq!(registry.avg_latency_ms("conn:a"), (0.7 * 120.0 + 0.3 * 20.0).round() as i64);
    }

    #[test]
    fn pick_best_prefers_healthy_then_latency_weight() {
        let registry = HealthRegistry::new();
        let a = provider("a", 1);
        let b = provider("b", 1);
        registry.mark_success(&a.key, 500);
        registry.mark_success(&b.key, 50);
        let ranked = registry.pick_best(&[a, b]);
        assert_eq!(ranked[0].name, "b");
    }

    #[test]
    fn pick_best_falls_back_to_full_list_when_all_open() {
        let registry = HealthRegistry::new();
        let a = provider("a", 1);
        for _ in 0..5 {
            registry.mark_failure(&a.key);
        }
        let ranked = registry.pick_best(std::slice::from_ref(&a));
        assert_eq!(ranked.len(), 1);
    }
}
