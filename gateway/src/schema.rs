use serde_json::Value;
use std::collections::HashMap;

/// A field constraint checked by [`ResponseSchema::validate`]. Deliberately
/// small: the original's pydantic models only ever gate on presence and a
/// coarse JSON type, never on ranges or custom validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Any,
}

/// A named, required-field/type check against a `serde_json::Value` —
/// structurally the same contract as `model.model_validate(data)` raising a
/// `ValidationError`, without pulling in a schema DSL this spec doesn't need.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub required_fields: Vec<(String, FieldKind)>,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, required_fields: Vec<(&str, FieldKind)>) -> Self {
        Self {
            name: name.into(),
            required_fields: required_fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    /// Returns `Some(error message)` on the first missing/mismatched field,
    /// `None` if the value satisfies every required field.
    pub fn validate(&self, value: &Value) -> Option<String> {
        let Value::Object(map) = value else {
            return Some(format!("expected a JSON object for schema '{}'", self.name));
        };
        for (field, kind) in &self.required_fields {
            match map.get(field) {
                None => return Some(format!("field '{field}' is required")),
                Some(found) if !kind_matches(found, *kind) => {
                    return Some(format!("field '{field}' has the wrong type"))
                }
                Some(_) => {}
            }
        }
        None
    }
}

fn kind_matches(value: &Value, kind: FieldKind) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Any => true,
    }
}

/// Process-wide set of named response models, registered at startup. A
/// connector opts in via `response_model: "<name>"`; an unregistered name is
/// simply never checked (drift detection is always optional, never load-bearing).
#[derive(Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, ResponseSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ResponseSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// The first 180 characters of the error message, matching the
    /// `x-apibridge-drift-msg` header truncation in §4.11.
    pub fn check(&self, model_name: &str, value: &Value) -> Option<String> {
        let schema = self.schemas.get(model_name)?;
        schema.validate(value).map(|msg| msg.chars().take(180).collect())
    }
}
