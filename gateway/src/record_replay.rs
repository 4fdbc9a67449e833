use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::config::GatewayMode;

/// A JSON body captured during `record` mode and replayed verbatim during
/// `replay` mode.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,
    pub body: Value,
}

/// Optional decoration around `proxy()`. In `live` mode (the default) this
/// is a pure pass-through: `lookup`/`capture` are never consulted. Grounded
/// in the original's `_RECORDINGS` dict keyed by `_rr_key`.
pub struct RecordReplay {
    mode: GatewayMode,
    captured: Mutex<HashMap<String, CapturedResponse>>,
}

impl RecordReplay {
    pub fn new(mode: GatewayMode) -> Self {
        Self { mode, captured: Mutex::new(HashMap::new()) }
    }

    pub fn mode(&self) -> GatewayMode {
        self.mode
    }

    /// `"<method>:<connector>/<path>?<query>"`, matching the original's
    /// `_rr_key` formula exactly.
    pub fn key(method: &str, connector: &str, residual_path: &str, raw_query: &str) -> String {
        format!("{method}:{connector}/{residual_path}?{raw_query}")
    }

    /// Returns the captured response for `key` when in `replay` mode; `None`
    /// in every other mode or on a cache miss.
    pub fn lookup(&self, key: &str) -> Option<CapturedResponse> {
        if self.mode != GatewayMode::Replay {
            return None;
        }
        self.captured.lock().unwrap().get(key).cloned()
    }

    /// Stores a successful response body for later replay. A no-op outside
    /// `record` mode.
    pub fn capture(&self, key: String, status: u16, body: Value) {
        if self.mode != GatewayMode::Record {
            return;
        }
        self.captured.lock().unwrap().insert(key, CapturedResponse { status, body });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn live_mode_never_captures_or_replays() {
        let rr = RecordReplay::new(GatewayMode::Live);
        rr.capture("k".into(), 200, json!({"a": 1}));
        assert!(rr.lookup("k").is_none());
    }

    #[test]
    fn record_then_replay_round_trips() {
        let recorder = RecordReplay::new(GatewayMode::Record);
        let key = RecordReplay::key("GET", "weather", "current.json", "q=Bogota");
        recorder.capture(key.clone(), 200, json!({"temp_c": 25}));

        let replayer = RecordReplay::new(GatewayMode::Replay);
        replayer.captured.lock().unwrap().insert(key.clone(), recorder.captured.lock().unwrap().get(&key).unwrap().clone());
        let found = replayer.lookup(&key).unwrap();
        assert_eq!(found.status, 200);
        assert_eq!(found.body, json!({"temp_c": 25}));
    }
}
