use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known ledger topics. Topics are free-form uppercase identifiers;
/// these are the ones the engine itself produces or reacts to.
pub mod topics {
    pub const ISSUE_OPENED: &str = "ISSUE_OPENED";
    pub const CLUSTER_OPERATIONS: &str = "CLUSTER_OPERATIONS";
    pub const TASK_STARTED: &str = "TASK_STARTED";
    pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
    pub const VALIDATION_RESULT: &str = "VALIDATION_RESULT";
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const AGENT_SCHEMA_WARNING: &str = "AGENT_SCHEMA_WARNING";
    pub const AGENT_HALTED: &str = "AGENT_HALTED";
    pub const AGENT_STALE: &str = "AGENT_STALE";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const LOGIC_ERROR: &str = "LOGIC_ERROR";
    pub const HOOK_ERROR: &str = "HOOK_ERROR";
    pub const STOP_CLUSTER: &str = "STOP_CLUSTER";
    pub const CLUSTER_COMPLETE: &str = "CLUSTER_COMPLETE";
}

/// Error codes carried in `AGENT_ERROR` payloads under `content.data.code`.
pub mod error_codes {
    pub const NO_MODEL_RULE: &str = "NO_MODEL_RULE";
    pub const MODEL_CEILING_VIOLATION: &str = "MODEL_CEILING_VIOLATION";
    pub const RUNNER_FAILURE: &str = "RUNNER_FAILURE";
    pub const SCHEMA_VIOLATION: &str = "SCHEMA_VIOLATION";
}

pub const SENDER_SYSTEM: &str = "system";
pub const SENDER_USER: &str = "user";
pub const RECEIVER_BROADCAST: &str = "broadcast";

/// Reserved metadata key marking a record that was re-emitted as a side
/// effect of dynamically adding subscribers to an earlier topic.
pub const META_REPUBLISHED: &str = "_republished";
/// Reserved metadata key describing where the seed input came from.
pub const META_SOURCE: &str = "source";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            data: None,
        }
    }

    pub fn data(data: Value) -> Self {
        Self {
            text: None,
            data: Some(data),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.data.is_none()
    }
}

/// A message as it exists before the ledger has assigned identity and order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub cluster_id: String,
    pub topic: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MessageDraft {
    pub fn new(
        cluster_id: impl Into<String>,
        topic: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            topic: topic.into(),
            sender: sender.into(),
            receiver: None,
            content: MessageContent::default(),
            metadata: Map::new(),
        }
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn content(mut self, content: MessageContent) -> Self {
        self.content = content;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn republished(self) -> Self {
        self.meta(META_REPUBLISHED, Value::Bool(true))
    }
}

/// A stored ledger record. `seq` is the per-ledger append counter that
/// breaks timestamp ties; `(timestamp, seq)` is the total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub seq: i64,
    /// Epoch milliseconds, clamped monotonic per cluster.
    pub timestamp: i64,
    pub cluster_id: String,
    pub topic: String,
    pub sender: String,
    pub receiver: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn is_republished(&self) -> bool {
        self.metadata
            .get(META_REPUBLISHED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == RECEIVER_BROADCAST
    }

    /// Whether an agent with the given id should see this message: it is
    /// broadcast, addressed to the agent, or addressed to the topic itself.
    pub fn addressed_to(&self, agent_id: &str) -> bool {
        self.is_broadcast() || self.receiver == agent_id || self.receiver == self.topic
    }

    /// The record as a JSON value, as exposed to trigger logic and hook
    /// placeholder resolution.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(topic: &str, receiver: &str) -> Message {
        Message {
            id: "m-1".to_string(),
            seq: 1,
            timestamp: 1_700_000_000_000,
            cluster_id: "c-1".to_string(),
            topic: topic.to_string(),
            sender: SENDER_SYSTEM.to_string(),
            receiver: receiver.to_string(),
            content: MessageContent::default(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn broadcast_reaches_every_agent() {
        let msg = stored(topics::ISSUE_OPENED, RECEIVER_BROADCAST);
        assert!(msg.addressed_to("worker"));
        assert!(msg.addressed_to("validator"));
    }

    #[test]
    fn direct_receiver_excludes_others() {
        let msg = stored(topics::VALIDATION_RESULT, "worker");
        assert!(msg.addressed_to("worker"));
        assert!(!msg.addressed_to("validator"));
    }

    #[test]
    fn topic_receiver_matches_topic_subscribers() {
        let msg = stored(topics::VALIDATION_RESULT, topics::VALIDATION_RESULT);
        assert!(msg.addressed_to("anyone"));
    }

    #[test]
    fn republished_flag_reads_metadata() {
        let mut msg = stored(topics::ISSUE_OPENED, RECEIVER_BROADCAST);
        assert!(!msg.is_republished());
        msg.metadata
            .insert(META_REPUBLISHED.to_string(), json!(true));
        assert!(msg.is_republished());
    }

    #[test]
    fn draft_builder_sets_republished_metadata() {
        let draft = MessageDraft::new("c-1", topics::ISSUE_OPENED, SENDER_SYSTEM).republished();
        assert_eq!(draft.metadata.get(META_REPUBLISHED), Some(&json!(true)));
    }
}
