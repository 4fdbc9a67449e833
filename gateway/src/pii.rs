use common_crypto::MasterKey;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiAction {
    Redact,
    Tokenize,
    Encrypt,
    Hash,
}

impl PiiAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "redact" => Some(Self::Redact),
            "tokenize" => Some(Self::Tokenize),
            "encrypt" => Some(Self::Encrypt),
            "hash" => Some(Self::Hash),
            _ => None,
        }
    }
}

/// Per-field redact/tokenize/encrypt/hash, plus a structural walk that
/// applies either a dotted-path rule map or a regex auto-scan.
pub struct PiiFirewall {
    key: Option<MasterKey>,
}

impl PiiFirewall {
    pub fn new(encryption_secret: Option<&str>) -> Self {
        Self { key: encryption_secret.map(MasterKey::from_secret) }
    }

    /// Applies one action to a string value. Non-string JSON values are
    /// returned unchanged by the caller before this is ever invoked.
    pub fn apply_action(&self, value: &str, action: PiiAction) -> String {
        match action {
            PiiAction::Redact => redact(value),
            PiiAction::Tokenize => format!("TOK_{}", &short_hash(value)),
            PiiAction::Hash => format!("HASH_{}", &short_hash(value)),
            PiiAction::Encrypt => match &self.key {
                Some(key) => match key.encrypt(value.as_bytes()) {
                    Ok(ciphertext) => base64_url_encode(&ciphertext),
                    Err(_) => value.to_string(),
                },
                None => value.to_string(),
            },
        }
    }

    pub fn decrypt(&self, encoded: &str) -> Option<String> {
        let key = self.key.as_ref()?;
        let bytes = base64_url_decode(encoded)?;
        let plaintext = key.decrypt(&bytes).ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// `rules` maps dotted field paths to action names. At each level: an
    /// exact key match applies its rule; an object value recurses with the
    /// prefix consumed from every remaining rule key; a list of objects
    /// recurses into each element with the same, un-narrowed rule set (not
    /// the prefix-stripped one — matching the original's list-recursion
    /// call, which re-passes the full `field_rules` unchanged); anything
    /// else passes through untouched.
    pub fn process_dict(&self, data: Value, rules: &HashMap<String, String>) -> Value {
        match data {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    if let Some(action_name) = rules.get(&key) {
                        if let (Value::String(s), Some(action)) = (&value, PiiAction::parse(action_name)) {
                            out.insert(key, Value::String(self.apply_action(s, action)));
                            continue;
                        }
                        out.insert(key, value);
                        continue;
                    }
                    match value {
                        Value::Object(_) => {
                            let nested_rules = narrow_rules(rules, &key);
                            if nested_rules.is_empty() {
                                out.insert(key, value);
                            } else {
                                out.insert(key, self.process_dict(value, &nested_rules));
                            }
                        }
                        Value::Array(items) => {
                            let processed = items
                                .into_iter()
                                .map(|item| {
                                    if item.is_object() {
                                        self.process_dict(item, rules)
                                    } else {
                                        item
                                    }
                                })
                                .collect();
                            out.insert(key, Value::Array(processed));
                        }
                        other => {
                            out.insert(key, other);
                        }
                    }
                }
                Value::Object(out)
            }
            other => other,
        }
    }

    /// Walks the structure; every string leaf has email/SSN/credit-card/
    /// phone/IPv4 substrings replaced by `apply_action(match, action)`.
    pub fn auto_scan(&self, data: Value, action: PiiAction) -> Value {
        match data {
            Value::String(s) => Value::String(self.scan_and_protect(&s, action)),
            Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, self.auto_scan(v, action))).collect()),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.auto_scan(v, action)).collect()),
            other => other,
        }
    }

    fn scan_and_protect(&self, text: &str, action: PiiAction) -> String {
        let mut result = text.to_string();
        for pattern in patterns() {
            result = pattern
                .replace_all(&result, |caps: &regex::Captures| self.apply_action(&caps[0], action))
                .into_owned();
        }
        result
    }
}

fn narrow_rules(rules: &HashMap<String, String>, prefix: &str) -> HashMap<String, String> {
    let needle = format!("{prefix}.");
    rules
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(&needle).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}

fn short_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Keeps the first and last character; inner characters become `*`.
/// Strings of length <= 2 become all `*`, preserving the original length.
fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 2 {
        return "*".repeat(chars.len());
    }
    let mut out = String::with_capacity(chars.len());
    out.push(chars[0]);
    out.push_str(&"*".repeat(chars.len() - 2));
    out.push(chars[chars.len() - 1]);
    out
}

fn base64_url_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    URL_SAFE_NO_PAD.encode(bytes)
}

fn base64_url_decode(value: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    URL_SAFE_NO_PAD.decode(value).ok()
}

const EMAIL: &str = r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b";

static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn patterns() -> &'static [Regex] {
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(EMAIL).unwrap(),
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap(),
            Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap(),
            Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redact_preserves_length_and_endpoints() {
        assert_eq!(redact("alice@example.com"), "a****************m");
        assert_eq!(redact("ab"), "**");
        assert_eq!(redact("a"), "*");
    }

    #[test]
    fn tokenize_and_hash_are_deterministic_and_fixed_length() {
        let firewall = PiiFirewall::new(None);
        let a = firewall.apply_action("alice@example.com", PiiAction::Tokenize);
        let b = firewall.apply_action("alice@example.com", PiiAction::Tokenize);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(a.starts_with("TOK_"));

        let h = firewall.apply_action("alice@example.com", PiiAction::Hash);
        assert_eq!(h.len(), 20);
        assert!(h.starts_with("HASH_"));
    }

    #[test]
    fn encrypt_round_trips() {
        let firewall = PiiFirewall::new(Some("test-secret"));
        let ciphertext = firewall.apply_action("secret-value", PiiAction::Encrypt);
        assert_ne!(ciphertext, "secret-value");
        let recovered = firewall.decrypt(&ciphertext).unwrap();
        assert_eq!(recovered, "secret-value");
    }

    #[test]
    fn process_dict_applies_rule_at_exact_key() {
        let firewall = PiiFirewall::new(None);
        let data = json!({"email": "alice@example.com", "name": "Alice"});
        let mut rules = HashMap::new();
        rules.insert("email".to_string(), "redact".to_string());
        let result = firewall.process_dict(data, &rules);
        assert_eq!(result["email"], json!("a****************m"));
        assert_eq!(result["name"], json!("Alice"));
    }

    #[test]
    fn process_dict_recurses_with_prefix_stripped() {
        let firewall = PiiFirewall::new(None);
        let data = json!({"customer": {"email": "alice@example.com", "id": 1}});
        let mut rules = HashMap::new();
        rules.insert("customer.email".to_string(), "hash".to_string());
        let result = firewall.process_dict(data, &rules);
        let email = result["customer"]["email"].as_str().unwrap();
        assert!(email.starts_with("HASH_"));
        assert_eq!(result["customer"]["id"], json!(1));
    }

    #[test]
    fn process_dict_recurses_into_list_of_objects_with_unnarrowed_rules() {
        let firewall = PiiFirewall::new(None);
        let data = json!({"customers": [{"email": "alice@example.com"}, {"email": "bob@example.com"}]});
        let mut rules = HashMap::new();
        rules.insert("email".to_string(), "redact".to_string());
        let result = firewall.process_dict(data, &rules);
        let redacted = result["customers"][0]["email"].as_str().unwrap();
        assert_eq!(redacted, "a****************m");
    }

    #[test]
    fn process_dict_list_recursion_does_not_narrow_prefixed_rule() {
        // Unlike object recursion, a list recurses with the same, un-narrowed
        // rule set, so a rule keyed "customers.email" never matches the
        // unprefixed "email" key inside each list element.
        let firewall = PiiFirewall::new(None);
        let data = json!({"customers": [{"email": "alice@example.com"}]});
        let mut rules = HashMap::new();
        rules.insert("customers.email".to_string(), "redact".to_string());
        let result = firewall.process_dict(data, &rules);
        assert_eq!(result["customers"][0]["email"], json!("alice@example.com"));
    }

    #[test]
    fn auto_scan_redacts_email_and_ssn_in_free_text() {
        let firewall = PiiFirewall::new(None);
        let data = json!({"note": "contact alice@example.com or ssn 123-45-6789"});
        let result = firewall.auto_scan(data, PiiAction::Redact);
        let note = result["note"].as_str().unwrap();
        assert!(!note.contains("alice@example.com"));
        assert!(!note.contains("123-45-6789"));
    }
}
