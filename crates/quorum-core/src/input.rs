use std::path::PathBuf;

use anyhow::Context;
use serde_json::Value;

use quorum_types::{topics, MessageContent, MessageDraft, META_SOURCE, SENDER_USER};

/// The work a cluster is started with: a markdown file, a GitHub issue
/// reference (already fetched by the front-end), or a plain text string.
#[derive(Debug, Clone)]
pub enum TaskInput {
    Text(String),
    File(PathBuf),
    Issue { reference: String, body: String },
}

impl TaskInput {
    fn source(&self) -> &'static str {
        match self {
            TaskInput::Text(_) => "text",
            TaskInput::File(_) => "file",
            TaskInput::Issue { .. } => "issue",
        }
    }

    /// The `ISSUE_OPENED` draft that seeds the cluster's ledger.
    pub fn seed_draft(&self, cluster_id: &str) -> anyhow::Result<MessageDraft> {
        let text = match self {
            TaskInput::Text(text) => text.clone(),
            TaskInput::File(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read input file {}", path.display()))?,
            TaskInput::Issue { body, .. } => body.clone(),
        };
        let mut draft = MessageDraft::new(cluster_id, topics::ISSUE_OPENED, SENDER_USER)
            .content(MessageContent::text(text))
            .meta(META_SOURCE, Value::String(self.source().to_string()));
        if let TaskInput::Issue { reference, .. } = self {
            draft = draft.meta("issue", Value::String(reference.clone()));
        }
        Ok(draft)
    }
}
