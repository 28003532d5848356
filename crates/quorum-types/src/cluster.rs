use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::{AgentDefinition, AgentStatus};
use crate::message::MessageContent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Running,
    Stopped,
    Failed,
    Completed,
}

impl ClusterState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ClusterState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

/// Persisted cluster metadata, kept in the `clusters.json` index. The
/// config reflects dynamically added agents as well as the starting set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: ClusterState,
    pub config: ClusterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: ClusterState,
    pub agent_count: usize,
}

impl From<&ClusterRecord> for ClusterSummary {
    fn from(record: &ClusterRecord) -> Self {
        Self {
            id: record.id.clone(),
            created_at: record.created_at,
            state: record.state,
            agent_count: record.config.agents.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub summary: ClusterSummary,
    pub agents: Vec<AgentStatus>,
    pub message_count: u64,
}

/// One entry in a `CLUSTER_OPERATIONS` message. Operations are applied in
/// declared order and atomically with respect to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClusterOperation {
    AddAgents {
        agents: Vec<AgentDefinition>,
    },
    RemoveAgent {
        id: String,
    },
    Publish {
        topic: String,
        #[serde(default)]
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterOperations {
    #[serde(default)]
    pub operations: Vec<ClusterOperation>,
}

impl ClusterOperations {
    /// Parse the operation list out of a `CLUSTER_OPERATIONS` payload.
    pub fn from_payload(data: &Value) -> Result<Self, String> {
        serde_json::from_value(data.clone())
            .map_err(|err| format!("invalid cluster operations payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states() {
        assert!(!ClusterState::Running.is_terminal());
        assert!(ClusterState::Stopped.is_terminal());
        assert!(ClusterState::Failed.is_terminal());
        assert!(ClusterState::Completed.is_terminal());
    }

    #[test]
    fn operations_parse_in_declared_order() {
        let ops = ClusterOperations::from_payload(&json!({
            "operations": [
                { "op": "add_agents", "agents": [{ "id": "worker" }] },
                { "op": "publish", "topic": "ISSUE_OPENED",
                  "metadata": { "_republished": true } },
                { "op": "stop", "reason": "done" }
            ]
        }))
        .unwrap();
        assert_eq!(ops.operations.len(), 3);
        assert!(matches!(ops.operations[0], ClusterOperation::AddAgents { .. }));
        assert!(matches!(ops.operations[1], ClusterOperation::Publish { .. }));
        assert!(matches!(ops.operations[2], ClusterOperation::Stop { .. }));
    }

    #[test]
    fn malformed_operations_are_rejected() {
        let err = ClusterOperations::from_payload(&json!({
            "operations": [{ "op": "teleport" }]
        }))
        .unwrap_err();
        assert!(err.contains("invalid cluster operations payload"));
    }
}
