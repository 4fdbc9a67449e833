use serde_json::Value;

/// Metadata attached to every response before a transform/PII pass sees it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransformContext {
    pub provider: String,
    pub status: u16,
    pub latency_ms: i64,
}

/// Wraps the upstream body as `{meta, ...body}` if it's a JSON object, else
/// `{meta, data: body}`, per §3's `TransformContext`.
fn wrap_with_meta(body: &Value, meta: &TransformContext) -> Value {
    let meta_value = serde_json::to_value(meta).unwrap_or(Value::Null);
    match body {
        Value::Object(map) => {
            let mut merged = serde_json::Map::new();
            merged.insert("meta".to_string(), meta_value);
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        other => {
            let mut merged = serde_json::Map::new();
            merged.insert("meta".to_string(), meta_value);
            merged.insert("data".to_string(), other.clone());
            Value::Object(merged)
        }
    }
}

/// Evaluates a JMESPath-family expression against the wrapped body. Any
/// parse or evaluation failure fails open: the original body is returned
/// bit-identical rather than surfacing an error to the caller.
pub fn apply_transform(body: &Value, expression: Option<&str>, meta: &TransformContext) -> Value {
    let Some(expression) = expression else {
        return body.clone();
    };
    let wrapped = wrap_with_meta(body, meta);
    let run = || -> Result<Value, Box<dyn std::error::Error>> {
        let compiled = jmespath::compile(expression)?;
        let result = compiled.search(&wrapped)?;
        let as_json: Value = serde_json::to_value(&*result)?;
        Ok(as_json)
    };
    match run() {
        Ok(value) => value,
        Err(_) => body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> TransformContext {
        TransformContext { provider: "provider-a".into(), status: 200, latency_ms: 42 }
    }

    #[test]
    fn identity_style_expression_extracts_nested_field() {
        let body = json!({"current": {"temp_c": 25, "humidity": 60}, "location": {"name": "Bogota"}});
        let result = apply_transform(&body, Some("current.temp_c"), &meta());
        assert_eq!(result, json!(25));
    }

    #[test]
    fn invalid_expression_fails_open() {
        let body = json!({"a": 1});
        let result = apply_transform(&body, Some("[[[not valid"), &meta());
        assert_eq!(result, body);
    }

    #[test]
    fn no_expression_returns_body_unchanged() {
        let body = json!({"a": 1});
        let result = apply_transform(&body, None, &meta());
        assert_eq!(result, body);
    }

    #[test]
    fn non_object_body_is_wrapped_under_data() {
        let body = json!([1, 2, 3]);
        let result = apply_transform(&body, Some("data"), &meta());
        assert_eq!(result, json!([1, 2, 3]));
    }
}
