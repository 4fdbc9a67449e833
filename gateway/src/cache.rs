use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A cached upstream response: raw bytes, the headers that were passed
/// through, and the status code. `headers` keeps insertion order since it is
/// replayed verbatim on a cache hit.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub expires_at: u64,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub status: u16,
}

/// In-memory TTL store, guarded by one mutex. Lookups lazily evict expired
/// entries rather than relying on a background sweep.
pub struct Cache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut guard = self.entries.lock().unwrap();
        match guard.get(key) {
            Some(entry) if entry.expires_at >= now_unix() => Some(entry.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: String, body: Vec<u8>, headers: Vec<(String, String)>, status: u16, ttl_secs: u64) {
        let entry = CacheEntry {
            expires_at: now_unix() + ttl_secs,
            body,
            headers,
            status,
        };
        self.entries.lock().unwrap().insert(key, entry);
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Builds the cache key formula from §4.3: computed from the first ranked
/// provider's base URL *before* failover, so identical requests hash
/// identically regardless of which provider ultimately serves the miss.
pub fn cache_key(connector: &str, method: &str, first_provider_base_url: &str, residual_path: &str, raw_query: &str) -> String {
    format!("{connector}:{method}:{first_provider_base_url}{residual_path}?{raw_query}")
}
