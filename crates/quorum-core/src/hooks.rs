//! Declarative post-task actions.
//!
//! Hook payloads may reference the parsed task result and a pinned ledger
//! view through `{{result.path}}` and `{{ledger.last(TOPIC).path}}`
//! placeholders. Unknown paths are rejected at resolve time rather than
//! silently producing empty strings; any failing action is published as a
//! `HOOK_ERROR` record and the remaining actions still run.

use serde_json::{Map, Value};
use thiserror::Error;

use quorum_types::{topics, HookAction, Message, MessageContent, MessageDraft};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown placeholder path `{0}`")]
    UnknownPath(String),

    #[error("malformed placeholder `{0}`")]
    Syntax(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("sub-cluster spawn failed: {0}")]
    Spawn(String),
}

/// What hook actions are allowed to do to their cluster.
#[async_trait::async_trait]
pub trait HookHost: Send + Sync {
    fn cluster_id(&self) -> String;
    fn publish(&self, draft: MessageDraft) -> Result<Message, HookError>;
    fn stop_cluster(&self, reason: Option<String>);
    fn ledger_last(&self, topic: &str) -> Result<Option<Message>, HookError>;
    async fn spawn_sub_cluster(
        &self,
        config: &Value,
        input: &str,
        wait_for_topic: Option<&str>,
    ) -> Result<Value, HookError>;
}

/// Run a hook list in order. Failures publish `HOOK_ERROR` and do not stop
/// later actions. Returns the number of actions that failed.
pub async fn run_hooks(
    host: &dyn HookHost,
    agent_id: &str,
    phase: &str,
    actions: &[HookAction],
    result: &Value,
) -> usize {
    let mut failures = 0;
    for (index, action) in actions.iter().enumerate() {
        if let Err(err) = run_one(host, agent_id, action, result).await {
            failures += 1;
            tracing::warn!(
                agent = agent_id,
                phase,
                index,
                error = %err,
                "hook action failed"
            );
            let diagnostic = MessageDraft::new(host.cluster_id(), topics::HOOK_ERROR, agent_id)
                .content(MessageContent::data(serde_json::json!({
                    "phase": phase,
                    "action_index": index,
                    "action": action_kind(action),
                    "error": err.to_string(),
                })));
            if let Err(publish_err) = host.publish(diagnostic) {
                tracing::error!(
                    agent = agent_id,
                    error = %publish_err,
                    "failed to publish HOOK_ERROR"
                );
            }
        }
    }
    failures
}

fn action_kind(action: &HookAction) -> &'static str {
    match action {
        HookAction::PublishMessage { .. } => "publish_message",
        HookAction::StopCluster { .. } => "stop_cluster",
        HookAction::SpawnSubCluster { .. } => "spawn_sub_cluster",
        HookAction::Noop => "noop",
    }
}

async fn run_one(
    host: &dyn HookHost,
    agent_id: &str,
    action: &HookAction,
    result: &Value,
) -> Result<(), HookError> {
    match action {
        HookAction::Noop => Ok(()),
        HookAction::StopCluster { reason } => {
            host.stop_cluster(reason.clone());
            Ok(())
        }
        HookAction::PublishMessage {
            topic,
            content,
            receiver,
            metadata,
        } => {
            let topic = interpolate_to_string(topic, result, host)?;
            let mut draft = MessageDraft::new(host.cluster_id(), topic, agent_id);
            if let Some(receiver) = receiver {
                draft = draft.receiver(interpolate_to_string(receiver, result, host)?);
            }
            let mut content = content.clone();
            if let Some(text) = content.text.take() {
                content.text = Some(interpolate_to_string(&text, result, host)?);
            }
            if let Some(mut data) = content.data.take() {
                interpolate_value(&mut data, result, host)?;
                content.data = Some(data);
            }
            draft = draft.content(content);
            for (key, value) in interpolate_map(metadata, result, host)? {
                draft = draft.meta(key, value);
            }
            host.publish(draft)?;
            Ok(())
        }
        HookAction::SpawnSubCluster {
            config,
            input,
            wait_for_topic,
        } => {
            let input = interpolate_to_string(input, result, host)?;
            host.spawn_sub_cluster(config, &input, wait_for_topic.as_deref())
                .await?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Placeholder resolution
// ---------------------------------------------------------------------------

/// Resolve one placeholder body, e.g. `result.summary` or
/// `ledger.last(VALIDATION_RESULT).content.data.errors`.
fn resolve_placeholder(
    body: &str,
    result: &Value,
    host: &dyn HookHost,
) -> Result<Value, HookError> {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix("result") {
        let value = follow_path(result, rest)
            .ok_or_else(|| HookError::UnknownPath(body.to_string()))?;
        return Ok(value);
    }
    if let Some(rest) = body.strip_prefix("ledger.last(") {
        let close = rest
            .find(')')
            .ok_or_else(|| HookError::Syntax(body.to_string()))?;
        let topic = rest[..close].trim();
        if topic.is_empty() {
            return Err(HookError::Syntax(body.to_string()));
        }
        let message = host
            .ledger_last(topic)?
            .ok_or_else(|| HookError::UnknownPath(body.to_string()))?;
        let value = follow_path(&message.to_value(), &rest[close + 1..])
            .ok_or_else(|| HookError::UnknownPath(body.to_string()))?;
        return Ok(value);
    }
    Err(HookError::UnknownPath(body.to_string()))
}

/// Follow a `.a.b.0.c` path. An empty path returns the value itself; a
/// missing segment is `None`.
fn follow_path(value: &Value, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value.clone());
    }
    let path = path.strip_prefix('.')?;
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Interpolate a template string. A string that is exactly one placeholder
/// yields the resolved value's string form; embedded placeholders render
/// inline (strings bare, other values as JSON).
pub fn interpolate_to_string(
    template: &str,
    result: &Value,
    host: &dyn HookHost,
) -> Result<String, HookError> {
    match interpolate(template, result, host)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

/// Interpolate a template string, preserving the resolved type when the
/// whole string is a single placeholder.
pub fn interpolate(
    template: &str,
    result: &Value,
    host: &dyn HookHost,
) -> Result<Value, HookError> {
    let trimmed = template.trim();
    if let Some(body) = exact_placeholder(trimmed) {
        return resolve_placeholder(body, result, host);
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| HookError::Syntax(template.to_string()))?;
        let resolved = resolve_placeholder(&after[..end], result, host)?;
        match resolved {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// The placeholder body when the whole string is `{{...}}` and nothing else.
fn exact_placeholder(raw: &str) -> Option<&str> {
    let body = raw.strip_prefix("{{")?.strip_suffix("}}")?;
    if body.contains("{{") || body.contains("}}") {
        return None;
    }
    Some(body)
}

/// Interpolate every string inside a JSON value in place. Whole-placeholder
/// strings keep the resolved value's type (number stays number).
pub fn interpolate_value(
    value: &mut Value,
    result: &Value,
    host: &dyn HookHost,
) -> Result<(), HookError> {
    match value {
        Value::String(s) if s.contains("{{") => {
            *value = interpolate(s, result, host)?;
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                interpolate_value(item, result, host)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, result, host)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Convenience for the metadata maps on hook payloads.
pub fn interpolate_map(
    map: &Map<String, Value>,
    result: &Value,
    host: &dyn HookHost,
) -> Result<Map<String, Value>, HookError> {
    let mut out = map.clone();
    for (_, value) in out.iter_mut() {
        interpolate_value(value, result, host)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockHost {
        published: Mutex<Vec<MessageDraft>>,
        stopped: Mutex<Option<Option<String>>>,
        last: Option<Message>,
    }

    #[async_trait::async_trait]
    impl HookHost for MockHost {
        fn cluster_id(&self) -> String {
            "c-1".to_string()
        }
        fn publish(&self, draft: MessageDraft) -> Result<Message, HookError> {
            self.published.lock().unwrap().push(draft.clone());
            Ok(Message {
                id: "m".to_string(),
                seq: 1,
                timestamp: 0,
                cluster_id: draft.cluster_id,
                topic: draft.topic,
                sender: draft.sender,
                receiver: draft.receiver.unwrap_or_else(|| "broadcast".to_string()),
                content: draft.content,
                metadata: draft.metadata,
            })
        }
        fn stop_cluster(&self, reason: Option<String>) {
            *self.stopped.lock().unwrap() = Some(reason);
        }
        fn ledger_last(&self, _topic: &str) -> Result<Option<Message>, HookError> {
            Ok(self.last.clone())
        }
        async fn spawn_sub_cluster(
            &self,
            _config: &Value,
            _input: &str,
            _wait_for_topic: Option<&str>,
        ) -> Result<Value, HookError> {
            Err(HookError::Spawn("not wired in tests".to_string()))
        }
    }

    fn result() -> Value {
        json!({ "summary": "done", "approved": false, "errors": ["A", "B"], "count": 3 })
    }

    #[tokio::test]
    async fn publish_message_interpolates_result_paths() {
        let host = MockHost::default();
        let actions = vec![HookAction::PublishMessage {
            topic: "VALIDATION_RESULT".to_string(),
            content: MessageContent {
                text: Some("validator says {{result.summary}}".to_string()),
                data: Some(json!({
                    "approved": "{{result.approved}}",
                    "first_error": "{{result.errors.0}}"
                })),
            },
            receiver: None,
            metadata: Map::new(),
        }];
        let failures = run_hooks(&host, "validator", "on_complete", &actions, &result()).await;
        assert_eq!(failures, 0);

        let published = host.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let draft = &published[0];
        assert_eq!(
            draft.content.text.as_deref(),
            Some("validator says done")
        );
        let data = draft.content.data.as_ref().unwrap();
        // Whole-placeholder strings keep the resolved type.
        assert_eq!(data["approved"], json!(false));
        assert_eq!(data["first_error"], json!("A"));
    }

    #[tokio::test]
    async fn unknown_path_publishes_hook_error() {
        let host = MockHost::default();
        let actions = vec![HookAction::PublishMessage {
            topic: "NEXT".to_string(),
            content: MessageContent::text("{{result.missing.deeply}}"),
            receiver: None,
            metadata: Map::new(),
        }];
        let failures = run_hooks(&host, "worker", "on_complete", &actions, &result()).await;
        assert_eq!(failures, 1);

        let published = host.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, topics::HOOK_ERROR);
        let data = published[0].content.data.as_ref().unwrap();
        assert_eq!(data["action"], json!("publish_message"));
        assert!(data["error"]
            .as_str()
            .unwrap()
            .contains("unknown placeholder path"));
    }

    #[tokio::test]
    async fn ledger_last_placeholder_reads_pinned_view() {
        let mut host = MockHost::default();
        host.last = Some(Message {
            id: "m-9".to_string(),
            seq: 9,
            timestamp: 5,
            cluster_id: "c-1".to_string(),
            topic: "VALIDATION_RESULT".to_string(),
            sender: "validator".to_string(),
            receiver: "broadcast".to_string(),
            content: MessageContent::data(json!({ "errors": ["missing test"] })),
            metadata: Map::new(),
        });
        let value = interpolate(
            "{{ledger.last(VALIDATION_RESULT).content.data.errors.0}}",
            &result(),
            &host,
        )
        .unwrap();
        assert_eq!(value, json!("missing test"));
    }

    #[tokio::test]
    async fn stop_cluster_reaches_the_host() {
        let host = MockHost::default();
        let actions = vec![HookAction::StopCluster {
            reason: Some("validators approved".to_string()),
        }];
        run_hooks(&host, "conductor", "on_complete", &actions, &result()).await;
        assert_eq!(
            host.stopped.lock().unwrap().clone(),
            Some(Some("validators approved".to_string()))
        );
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_later_ones() {
        let host = MockHost::default();
        let actions = vec![
            HookAction::PublishMessage {
                topic: "X".to_string(),
                content: MessageContent::text("{{result.nope}}"),
                receiver: None,
                metadata: Map::new(),
            },
            HookAction::StopCluster { reason: None },
        ];
        let failures = run_hooks(&host, "worker", "on_error", &actions, &result()).await;
        assert_eq!(failures, 1);
        assert!(host.stopped.lock().unwrap().is_some());
    }

    #[test]
    fn malformed_placeholder_is_a_syntax_error() {
        let host = MockHost::default();
        assert!(matches!(
            interpolate("{{result.summary", &result(), &host),
            Err(HookError::Syntax(_))
        ));
        assert!(matches!(
            interpolate("{{ledger.last(UNCLOSED}}", &result(), &host),
            Err(HookError::Syntax(_))
        ));
    }

    #[test]
    fn embedded_placeholders_render_inline() {
        let host = MockHost::default();
        let value = interpolate(
            "approved={{result.approved}} count={{result.count}}",
            &result(),
            &host,
        )
        .unwrap();
        assert_eq!(value, json!("approved=false count=3"));
    }
}
