use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("output is not JSON: {0}")]
    NotJson(String),

    #[error("schema failed to compile: {0}")]
    Compile(String),

    #[error("output does not match schema: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Pull a JSON object out of raw runner output. Accepts clean JSON, a
/// fenced ```json block, or an object embedded in surrounding prose.
pub fn parse_output(raw: &str) -> Result<Value, SchemaError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    if let Some(fenced) = extract_fenced(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            return Ok(value);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(SchemaError::NotJson(
        trimmed.chars().take(120).collect::<String>(),
    ))
}

fn extract_fenced(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Repair common model output drift against the declared schema: enum
/// values matched case-insensitively are rewritten to their canonical
/// spelling, and pipe-joined lists (`"simple|complex"`) collapse to the
/// first option that appears in the enum. Idempotent.
pub fn normalize_enums(value: &mut Value, schema: &Value) {
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if let Value::String(raw) = value {
            if let Some(canonical) = match_enum(raw, options) {
                *value = canonical;
            }
        }
        return;
    }
    match value {
        Value::Object(map) => {
            let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
                return;
            };
            for (key, field) in map.iter_mut() {
                if let Some(field_schema) = properties.get(key) {
                    normalize_enums(field, field_schema);
                }
            }
        }
        Value::Array(items) => {
            let Some(item_schema) = schema.get("items") else {
                return;
            };
            for item in items {
                normalize_enums(item, item_schema);
            }
        }
        _ => {}
    }
}

fn match_enum(raw: &str, options: &[Value]) -> Option<Value> {
    let exact = |candidate: &str| {
        options.iter().find(|option| {
            option
                .as_str()
                .map(|o| o.eq_ignore_ascii_case(candidate))
                .unwrap_or(false)
        })
    };
    if let Some(found) = exact(raw.trim()) {
        return Some(found.clone());
    }
    // Pipe-joined alternatives: take the first segment the enum knows.
    if raw.contains('|') {
        for segment in raw.split('|') {
            if let Some(found) = exact(segment.trim()) {
                return Some(found.clone());
            }
        }
    }
    None
}

/// Validate a parsed value against its JSON Schema.
pub fn validate(value: &Value, schema: &Value) -> Result<(), SchemaError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|err| SchemaError::Compile(err.to_string()))?;
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|err| format!("{} at {}", err, err.instance_path))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Invalid(errors))
    }
}
