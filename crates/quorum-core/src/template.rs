use std::collections::HashSet;
use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;

use quorum_types::{topics, ClusterConfig, HookAction, TriggerAction};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template base `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template base is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("template references unknown parameter `{0}`")]
    UnknownParam(String),

    #[error("malformed parameter reference in `{0}`")]
    Syntax(String),

    #[error("invalid cluster config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A parameterized cluster definition: a base document containing
/// `{{param}}` tokens plus the values to substitute. One level only: no
/// inheritance, no recursion.
#[derive(Debug, Clone)]
pub struct ClusterTemplate {
    pub base: Value,
    pub params: Map<String, Value>,
}

impl ClusterTemplate {
    pub fn from_file(path: &Path, params: Map<String, Value>) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            base: serde_json::from_str(&raw)?,
            params,
        })
    }

    /// Materialize the agent list: deep-substitute parameters (types
    /// preserved for whole-token strings), parse, and validate. Resolution
    /// has no hidden state; resolving an already-resolved document with the
    /// same parameters is a no-op.
    pub fn resolve(&self) -> Result<ClusterConfig, TemplateError> {
        let mut document = self.base.clone();
        substitute(&mut document, &self.params)?;
        let config: ClusterConfig = serde_json::from_value(document)?;
        validate_config(&config)?;
        Ok(config)
    }
}

fn substitute(value: &mut Value, params: &Map<String, Value>) -> Result<(), TemplateError> {
    match value {
        Value::String(raw) if raw.contains("{{") => {
            *value = substitute_string(raw, params)?;
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, params)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, params)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn substitute_string(raw: &str, params: &Map<String, Value>) -> Result<Value, TemplateError> {
    // A string that is exactly one token adopts the parameter's type.
    let trimmed = raw.trim();
    if let Some(name) = trimmed
        .strip_prefix("{{")
        .and_then(|r| r.strip_suffix("}}"))
    {
        let name = name.trim();
        if !name.contains("{{") && !name.contains("}}") {
            return params
                .get(name)
                .cloned()
                .ok_or_else(|| TemplateError::UnknownParam(name.to_string()));
        }
    }

    let mut out = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Syntax(raw.to_string()))?;
        let name = after[..end].trim();
        let resolved = params
            .get(name)
            .ok_or_else(|| TemplateError::UnknownParam(name.to_string()))?;
        match resolved {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Structural validation shared by templates and literal configs: agent ids
/// must be unique, and trigger topics nobody ever publishes draw a warning
/// (not an error, since a dynamically added agent may publish them later).
pub fn validate_config(config: &ClusterConfig) -> Result<(), TemplateError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for agent in &config.agents {
        if agent.id.trim().is_empty() {
            errors.push("agent id must not be empty".to_string());
        }
        if !seen.insert(agent.id.clone()) {
            errors.push(format!("duplicate agent id `{}`", agent.id));
        }
    }

    let mut published: HashSet<&str> = engine_topics().into_iter().collect();
    for agent in &config.agents {
        for trigger in &agent.triggers {
            if trigger.action == TriggerAction::PublishMessage {
                if let Some(topic) = trigger
                    .config
                    .as_ref()
                    .and_then(|c| c.get("topic"))
                    .and_then(Value::as_str)
                {
                    published.insert(topic);
                }
            }
        }
        for hook in agent
            .hooks
            .on_start
            .iter()
            .chain(&agent.hooks.on_complete)
            .chain(&agent.hooks.on_error)
        {
            if let HookAction::PublishMessage { topic, .. } = hook {
                published.insert(topic);
            }
        }
    }
    for agent in &config.agents {
        for trigger in &agent.triggers {
            if !published.contains(trigger.topic.as_str()) {
                tracing::warn!(
                    agent = %agent.id,
                    topic = %trigger.topic,
                    "trigger topic is not published by any configured agent"
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TemplateError::Invalid(errors))
    }
}

fn engine_topics() -> Vec<&'static str> {
    vec![
        topics::ISSUE_OPENED,
        topics::CLUSTER_OPERATIONS,
        topics::TASK_STARTED,
        topics::TASK_COMPLETED,
        topics::AGENT_ERROR,
        topics::AGENT_SCHEMA_WARNING,
        topics::AGENT_HALTED,
        topics::AGENT_STALE,
        topics::AGENT_TIMEOUT,
        topics::LOGIC_ERROR,
        topics::HOOK_ERROR,
        topics::STOP_CLUSTER,
        topics::CLUSTER_COMPLETE,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: Value) -> Map<String, Value> {
        pairs.as_object().cloned().unwrap()
    }

    fn base() -> Value {
        json!({
            "agents": [
                {
                    "id": "{{worker_id}}",
                    "role": "worker",
                    "max_iterations": "{{budget}}",
                    "prompt": "You are working on {{project}} as {{worker_id}}.",
                    "triggers": [
                        { "topic": "ISSUE_OPENED", "action": "execute_task" }
                    ]
                }
            ]
        })
    }

    #[test]
    fn resolves_params_preserving_types() {
        let template = ClusterTemplate {
            base: base(),
            params: params(json!({
                "worker_id": "rust-worker",
                "budget": 7,
                "project": "quorum"
            })),
        };
        let config = template.resolve().unwrap();
        assert_eq!(config.agents[0].id, "rust-worker");
        // `{{budget}}` was a whole token, so the number survives.
        assert_eq!(config.agents[0].max_iterations, 7);
        assert_eq!(
            config.agents[0].prompt.as_ref().unwrap().select(1),
            Some("You are working on quorum as rust-worker.")
        );
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let template = ClusterTemplate {
            base: base(),
            params: params(json!({ "worker_id": "w", "budget": 1 })),
        };
        let err = template.resolve().unwrap_err();
        assert!(matches!(err, TemplateError::UnknownParam(name) if name == "project"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let template = ClusterTemplate {
            base: base(),
            params: params(json!({
                "worker_id": "w",
                "budget": 3,
                "project": "p"
            })),
        };
        let once = template.resolve().unwrap();
        let again = ClusterTemplate {
            base: serde_json::to_value(&once).unwrap(),
            params: template.params.clone(),
        }
        .resolve()
        .unwrap();
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&again).unwrap()
        );
    }

    #[test]
    fn duplicate_agent_ids_fail_validation() {
        let config: ClusterConfig = serde_json::from_value(json!({
            "agents": [{ "id": "w" }, { "id": "w" }]
        }))
        .unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id"));
    }

    #[test]
    fn array_and_object_params_substitute_whole() {
        let template = ClusterTemplate {
            base: json!({
                "agents": [{
                    "id": "w",
                    "triggers": "{{triggers}}"
                }]
            }),
            params: params(json!({
                "triggers": [
                    { "topic": "ISSUE_OPENED", "action": "execute_task" }
                ]
            })),
        };
        let config = template.resolve().unwrap();
        assert_eq!(config.agents[0].triggers.len(), 1);
        assert_eq!(config.agents[0].triggers[0].topic, "ISSUE_OPENED");
    }
}
