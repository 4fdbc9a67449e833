use tracing_subscriber::EnvFilter;

const SENSITIVE_MARKERS: [&str; 4] = ["key", "token", "secret", "auth"];

/// Initializes the process-wide `tracing` subscriber. Filter level comes
/// from `LOG_LEVEL` (default `info`); falls back to `RUST_LOG` if set,
/// matching `tracing_subscriber`'s usual convention.
pub fn init() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// True if a header name looks like it carries a credential. Grounded in
/// the original's sensitive-header keyword match: a case-insensitive
/// substring check against `key`/`token`/`secret`/`auth`, not an exact
/// allowlist, so `X-Api-Key` and `Proxy-Authorization` both match.
pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Replaces the value of any sensitive header with `"REDACTED"` before it
/// is ever formatted into a log line. Enabled by `config.sanitize_logs`
/// (default true); callers pass `sanitize=false` to skip untouched.
pub fn redact_headers(headers: &[(String, String)], sanitize: bool) -> Vec<(String, String)> {
    if !sanitize {
        return headers.to_vec();
    }
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive_header(name) {
                (name.clone(), "REDACTED".to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}
