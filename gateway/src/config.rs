use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

/// Ambient process configuration, read once at startup. Distinct from
/// `ConnectorPolicy`, which is the per-connector routing/auth/budget rules
/// loaded from the connectors file.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub connectors_file: String,
    pub redis_url: Option<String>,
    pub mode: GatewayMode,
    pub auth_enabled: bool,
    pub valid_api_keys: Vec<String>,
    pub max_request_size_mb: u64,
    pub allowed_origins: Vec<String>,
    pub sanitize_logs: bool,
    pub pii_encryption_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    Live,
    Record,
    Replay,
}

impl GatewayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Live => "live",
            GatewayMode::Record => "record",
            GatewayMode::Replay => "replay",
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let connectors_file = env::var("CONNECTORS_FILE").unwrap_or_else(|_| "connectors.yaml".to_string());
        let redis_url = env::var("REDIS_URL").ok();
        let mode = match env::var("APIBRIDGE_MODE").unwrap_or_else(|_| "live".to_string()).as_str() {
            "record" => GatewayMode::Record,
            "replay" => GatewayMode::Replay,
            _ => GatewayMode::Live,
        };
        let auth_enabled = env::var("AUTH_ENABLED").ok().as_deref() == Some("true");
        let valid_api_keys = env::var("VALID_API_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let max_request_size_mb = env::var("MAX_REQUEST_SIZE_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let sanitize_logs = env::var("SANITIZE_LOGS").ok().as_deref() != Some("false");
        let pii_encryption_key = env::var("PII_ENCRYPTION_KEY").ok();

        Ok(Self {
            host,
            port,
            connectors_file,
            redis_url,
            mode,
            auth_enabled,
            valid_api_keys,
            max_request_size_mb,
            allowed_origins,
            sanitize_logs,
            pii_encryption_key,
        })
    }
}

/// Tagged auth variant. Only the OAuth2 form may suspend (it refreshes a
/// token cache entry); the others are pure header/query injection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AuthSpec {
    ApiKeyHeader { name: String, value: String },
    ApiKeyQuery { name: String, value: String },
    Bearer { token: String },
    Oauth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        extra_params: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderConfig {
    name: String,
    base_url: String,
    #[serde(default = "default_weight")]
    weight: i64,
    #[serde(default)]
    auth: Option<AuthSpec>,
}

fn default_weight() -> i64 {
    1
}

/// A concrete upstream: base URL, weight, optional per-provider auth, and
/// the `__key` identity used in the health/circuit-breaker maps.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    pub weight: i64,
    pub auth: Option<AuthSpec>,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSpec {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategySpec {
    #[serde(default = "default_strategy_policy")]
    pub policy: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_strategy_policy() -> String {
    "fastest_healthy_then_cheapest".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_retries() -> u32 {
    1
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self { policy: default_strategy_policy(), timeout_ms: default_timeout_ms(), retries: default_retries() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExceed {
    Block,
    DowngradeProvider,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetSpec {
    pub monthly_usd_max: f64,
    pub on_exceed: OnExceed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformsSpec {
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PiiProtectionSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_scan: bool,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub field_rules: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectorPolicyConfig {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    providers: Vec<ProviderConfig>,
    #[serde(default)]
    allow_paths: Vec<String>,
    rate_limit: RateLimitSpec,
    #[serde(default)]
    cache_ttl_seconds: u64,
    #[serde(default)]
    strategy: StrategySpec,
    #[serde(default)]
    auth: Option<AuthSpec>,
    #[serde(default)]
    static_headers: HashMap<String, String>,
    #[serde(default)]
    static_params: HashMap<String, String>,
    #[serde(default)]
    transforms: Option<TransformsSpec>,
    #[serde(default)]
    budget: Option<BudgetSpec>,
    #[serde(default)]
    passthrough_headers: Vec<String>,
    #[serde(default)]
    response_model: Option<String>,
    #[serde(default)]
    cost_per_call_usd: f64,
    #[serde(default)]
    pii_protection: Option<PiiProtectionSpec>,
}

/// Immutable per-connector routing/auth/budget rules, parsed once at load
/// and never mutated. `allow_paths` is pre-compiled into anchored regexes
/// so admission checks never re-parse a pattern per request.
#[derive(Clone)]
pub struct ConnectorPolicy {
    pub name: String,
    pub base_url: Option<String>,
    pub providers: Vec<Provider>,
    allow_path_patterns: Vec<Regex>,
    pub rate_limit: RateLimitSpec,
    pub cache_ttl_seconds: u64,
    pub strategy: StrategySpec,
    pub auth: Option<AuthSpec>,
    pub static_headers: HashMap<String, String>,
    pub static_params: HashMap<String, String>,
    pub transforms: Option<TransformsSpec>,
    pub budget: Option<BudgetSpec>,
    pub passthrough_headers: Vec<String>,
    pub response_model: Option<String>,
    pub cost_per_call_usd: f64,
    pub pii_protection: Option<PiiProtectionSpec>,
}

impl ConnectorPolicy {
    /// Normalizes and admits a residual path per §4.8: decode once, collapse
    /// `//`, strip trailing `/` (a lone `/` survives), reject `..`, ensure a
    /// leading `/`, then require a full anchored match against `allow_paths`.
    pub fn path_allowed(&self, raw_path: &str) -> bool {
        let normalized = normalize_path(raw_path);
        if normalized.contains("..") {
            return false;
        }
        self.allow_path_patterns.iter().any(|re| re.is_match(&normalized))
    }
}

pub fn normalize_path(raw_path: &str) -> String {
    let decoded = percent_decode(raw_path);
    let mut collapsed = String::with_capacity(decoded.len());
    let mut prev_slash = false;
    for ch in decoded.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(ch);
    }
    let mut trimmed = collapsed.trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        trimmed = "/".to_string();
    }
    if !trimmed.starts_with('/') {
        trimmed = format!("/{trimmed}");
    }
    trimmed
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `${NAME}` / `${NAME:default}` substitution against `std::env::var`,
/// applied to the raw config text before YAML parsing.
pub fn expand_env(text: &str) -> String {
    let re = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]*))?\}").unwrap();
    re.replace_all(text, |caps: &regex::Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        }
    })
    .into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read connectors file '{path}': {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse connectors file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("connector '{0}' has neither providers nor base_url")]
    ConnectorMisconfigured(String),
    #[error("connector '{0}' has an invalid allow_paths pattern: {1}")]
    InvalidPattern(String, regex::Error),
}

pub fn load_connectors(path: &str) -> Result<HashMap<String, ConnectorPolicy>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_string(), source })?;
    parse_connectors(&raw)
}

pub fn parse_connectors(raw: &str) -> Result<HashMap<String, ConnectorPolicy>, ConfigError> {
    let expanded = expand_env(raw);
    let configs: HashMap<String, ConnectorPolicyConfig> = serde_yaml::from_str(&expanded)?;
    let mut policies = HashMap::with_capacity(configs.len());
    for (name, cfg) in configs {
        if cfg.providers.is_empty() && cfg.base_url.is_none() {
            return Err(ConfigError::ConnectorMisconfigured(name));
        }
        let mut allow_path_patterns = Vec::with_capacity(cfg.allow_paths.len());
        for pattern in &cfg.allow_paths {
            let anchored = format!("^(?:{pattern})$");
            allow_path_patterns.push(Regex::new(&anchored).map_err(|e| ConfigError::InvalidPattern(name.clone(), e))?);
        }
        let providers = cfg
            .providers
            .into_iter()
            .map(|p| Provider { key: format!("{name}:{}", p.name), name: p.name, base_url: p.base_url, weight: p.weight, auth: p.auth })
            .collect();
        policies.insert(
            name.clone(),
            ConnectorPolicy {
                name,
                base_url: cfg.base_url,
                providers,
                allow_path_patterns,
                rate_limit: cfg.rate_limit,
                cache_ttl_seconds: cfg.cache_ttl_seconds,
                strategy: cfg.strategy,
                auth: cfg.auth,
                static_headers: cfg.static_headers,
                static_params: cfg.static_params,
                transforms: cfg.transforms,
                budget: cfg.budget,
                passthrough_headers: cfg.passthrough_headers.into_iter().map(|h| h.to_lowercase()).collect(),
                response_model: cfg.response_model,
                cost_per_call_usd: cfg.cost_per_call_usd,
                pii_protection: cfg.pii_protection,
            },
        );
    }
    Ok(policies)
}

/// Reads, expands, and parses the connectors file; re-checked per-connector
/// at request time too, since policies can in principle be hot-reloaded.
pub fn load_config(path: &str) -> anyhow::Result<HashMap<String, ConnectorPolicy>> {
    load_connectors(path).with_context(|| format!("loading connectors file '{path}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_collapses_and_trims() {
        assert_eq!(normalize_path("/api//users/"), "/api/users");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("%2Fapi%2Fusers"), "/api/users");
    }

    fn policy_with_allow(patterns: &[&str]) -> ConnectorPolicy {
        ConnectorPolicy {
            name: "c".into(),
            base_url: Some("https://example.com".into()),
            providers: vec![],
            allow_path_patterns: patterns.iter().map(|p| Regex::new(&format!("^(?:{p})$")).unwrap()).collect(),
            rate_limit: RateLimitSpec { capacity: 10.0, refill_per_sec: 1.0 },
            cache_ttl_seconds: 0,
            strategy: StrategySpec::default(),
            auth: None,
            static_headers: HashMap::new(),
            static_params: HashMap::new(),
            transforms: None,
            budget: None,
            passthrough_headers: vec![],
            response_model: None,
            cost_per_call_usd: 0.0,
            pii_protection: None,
        }
    }

    #[test]
    fn path_admission_matches_spec_examples() {
        let policy = policy_with_allow(&["/api/users"]);
        assert!(policy.path_allowed("/api/users"));
        assert!(policy.path_allowed("/api/users/"));
        assert!(policy.path_allowed("/api//users"));
        assert!(policy.path_allowed("%2Fapi%2Fusers"));
        assert!(!policy.path_allowed("/api/users/1"));
        assert!(!policy.path_allowed("/api/%2E%2E/admin"));
        assert!(!policy.path_allowed("/API/USERS"));
    }

    #[test]
    fn env_substitution_uses_default_when_unset() {
        std::env::remove_var("APIBRIDGE_TEST_UNSET_VAR");
        let out = expand_env("key: ${APIBRIDGE_TEST_UNSET_VAR:fallback}");
        assert_eq!(out, "key: fallback");
    }

    #[test]
    fn env_substitution_prefers_set_value() {
        std::env::set_var("APIBRIDGE_TEST_SET_VAR", "real");
        let out = expand_env("key: ${APIBRIDGE_TEST_SET_VAR:fallback}");
        assert_eq!(out, "key: real");
        std::env::remove_var("APIBRIDGE_TEST_SET_VAR");
    }

    #[test]
    fn rejects_connector_with_neither_providers_nor_base_url() {
        let yaml = "broken:\n  allow_paths: [\"/x\"]\n  rate_limit: {capacity: 1, refill_per_sec: 1}\n";
        let err = parse_connectors(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ConnectorMisconfigured(name) if name == "broken"));
    }

    #[test]
    fn rejects_unknown_top_level_fields() {
        let yaml = "c:\n  base_url: https://x.example\n  allow_paths: [\"/x\"]\n  rate_limit: {capacity: 1, refill_per_sec: 1}\n  bogus_field: 1\n";
        assert!(parse_connectors(yaml).is_err());
    }
}
