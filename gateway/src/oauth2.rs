use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

const EXPIRY_BUFFER_SECS: f64 = 60.0;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct OAuth2Token {
    pub access_token: String,
    pub expires_at_unix: f64,
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuth2Token {
    fn is_valid(&self) -> bool {
        now_unix() < self.expires_at_unix - EXPIRY_BUFFER_SECS
    }
}

fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: f64,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    scope: Option<String>,
}

fn default_expires_in() -> f64 {
    3600.0
}
fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(thiserror::Error, Debug)]
pub enum OAuth2Error {
    #[error("token endpoint returned status {0}")]
    BadStatus(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Single-flight client-credentials refresh, keyed by provider `__key`. The
/// outer map lock is held only long enough to get-or-create the per-key
/// lock; the refresh itself runs while holding only that inner lock, so
/// concurrent callers for different providers never block each other.
pub struct OAuth2TokenCache {
    http: reqwest::Client,
    locks: Mutex<HashMap<String, Arc<Mutex<Option<OAuth2Token>>>>>,
}

impl OAuth2TokenCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http, locks: Mutex::new(HashMap::new()) }
    }

    async fn key_lock(&self, provider_key: &str) -> Arc<Mutex<Option<OAuth2Token>>> {
        let mut map = self.locks.lock().await;
        map.entry(provider_key.to_string()).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
    }

    pub async fn invalidate(&self, provider_key: &str) {
        let lock = self.key_lock(provider_key).await;
        *lock.lock().await = None;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_token(
        &self,
        provider_key: &str,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
        extra_params: &HashMap<String, String>,
    ) -> Result<String, OAuth2Error> {
        let lock = self.key_lock(provider_key).await;
        let mut slot = lock.lock().await;

        if let Some(token) = slot.as_ref() {
            if token.is_valid() {
                return Ok(token.access_token.clone());
            }
        }

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }
        for (k, v) in extra_params {
            form.push((k.as_str(), v.as_str()));
        }

        let response = self
            .http
            .post(token_url)
            .timeout(std::time::Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS))
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OAuth2Error::BadStatus(response.status().as_u16()));
        }

        let parsed: TokenResponse = response.json().await?;
        let token = OAuth2Token {
            access_token: parsed.access_token,
            expires_at_unix: now_unix() + parsed.expires_in,
            token_type: parsed.token_type,
            scope: parsed.scope,
        };
        let access_token = token.access_token.clone();
        *slot = Some(token);
        Ok(access_token)
    }
}
