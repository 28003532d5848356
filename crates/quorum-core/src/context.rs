use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use quorum_ledger::{Ledger, LedgerResult, MessageFilter};
use quorum_types::{AgentDefinition, Message, OutputFormat, SinceSpec};

/// Where a context build anchors its relative `since` bounds.
#[derive(Debug, Clone, Copy)]
pub struct ContextAnchors {
    pub cluster_created_at: DateTime<Utc>,
    pub last_task_end: Option<DateTime<Utc>>,
}

/// Assemble the prompt for one task: the agent's system prompt, then the
/// configured ledger slices in declared order, then (for schema-carrying
/// stream output) the canonical output-format block.
pub fn build_prompt(
    definition: &AgentDefinition,
    iteration: u32,
    anchors: ContextAnchors,
    ledger: &Ledger,
    effective_format: OutputFormat,
    schema: Option<&Value>,
) -> LedgerResult<String> {
    let mut sections: Vec<String> = Vec::new();

    if let Some(prompt) = &definition.prompt {
        if let Some(system) = prompt.select(iteration) {
            sections.push(system.to_string());
        }
    }

    for source in &definition.context_strategy.sources {
        let mut filter = MessageFilter::topic(&source.topic);
        if let Some(sender) = &source.sender {
            filter = filter.sender(sender.clone());
        }
        if let Some(since) = resolve_since(source.since.as_ref(), anchors) {
            filter = filter.since(since);
        }
        if let Some(limit) = source.limit {
            filter = filter.limit(limit);
        }
        let messages = ledger.query(&filter)?;
        sections.push(render_topic(&source.topic, &messages));
    }

    if effective_format == OutputFormat::StreamJson {
        if let Some(schema) = schema {
            sections.push(output_format_block(schema));
        }
    }

    Ok(sections.join("\n\n"))
}

fn resolve_since(since: Option<&SinceSpec>, anchors: ContextAnchors) -> Option<i64> {
    match since? {
        SinceSpec::ClusterStart => Some(anchors.cluster_created_at.timestamp_millis()),
        SinceSpec::LastTaskEnd => Some(
            anchors
                .last_task_end
                .unwrap_or(anchors.cluster_created_at)
                .timestamp_millis(),
        ),
        SinceSpec::At(ts) => Some(ts.timestamp_millis()),
    }
}

fn render_topic(topic: &str, messages: &[Message]) -> String {
    let mut out = format!("Messages from topic: {topic}");
    if messages.is_empty() {
        out.push_str("\n(none)");
        return out;
    }
    for message in messages {
        let when = Utc
            .timestamp_millis_opt(message.timestamp)
            .single()
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| message.timestamp.to_string());
        out.push_str(&format!(
            "\n{} ({}): {}",
            message.sender,
            when,
            message.content.text.as_deref().unwrap_or("")
        ));
        if let Some(data) = &message.content.data {
            let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
            out.push('\n');
            out.push_str(&pretty);
        }
    }
    out
}

fn output_format_block(schema: &Value) -> String {
    let pretty =
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "OUTPUT FORMAT\n\
         Respond with exactly one JSON object conforming to this schema. \
         No markdown, no code fences, no commentary before or after it.\n\
         {pretty}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::{
        topics, ContextSource, ContextStrategy, MessageContent, MessageDraft, PromptSpec,
    };
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn worker_definition() -> AgentDefinition {
        let mut def = AgentDefinition::new("worker");
        def.prompt = Some(PromptSpec::Static("You implement changes.".to_string()));
        def.context_strategy = ContextStrategy {
            sources: vec![
                ContextSource {
                    topic: topics::ISSUE_OPENED.to_string(),
                    sender: None,
                    since: Some(SinceSpec::ClusterStart),
                    limit: None,
                },
                ContextSource {
                    topic: topics::VALIDATION_RESULT.to_string(),
                    sender: Some("validator".to_string()),
                    since: Some(SinceSpec::LastTaskEnd),
                    limit: None,
                },
            ],
        };
        def
    }

    fn ledger(dir: &TempDir) -> Arc<Ledger> {
        Arc::new(Ledger::open(dir.path(), "c-1").unwrap())
    }

    #[test]
    fn prompt_leads_with_system_and_renders_topic_sections() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger
            .append(
                MessageDraft::new("c-1", topics::ISSUE_OPENED, "user")
                    .content(MessageContent::text("Implement X")),
            )
            .unwrap();

        let anchors = ContextAnchors {
            cluster_created_at: Utc.timestamp_millis_opt(0).single().unwrap(),
            last_task_end: None,
        };
        let prompt = build_prompt(
            &worker_definition(),
            1,
            anchors,
            &ledger,
            OutputFormat::Json,
            None,
        )
        .unwrap();

        assert!(prompt.starts_with("You implement changes."));
        let issue_at = prompt.find("Messages from topic: ISSUE_OPENED").unwrap();
        let validation_at = prompt
            .find("Messages from topic: VALIDATION_RESULT")
            .unwrap();
        assert!(issue_at < validation_at);
        assert!(prompt.contains("user ("));
        assert!(prompt.contains("Implement X"));
    }

    #[test]
    fn last_task_end_scopes_out_older_feedback() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let old = ledger
            .append(
                MessageDraft::new("c-1", topics::VALIDATION_RESULT, "validator")
                    .content(MessageContent::data(json!({ "errors": ["A"] }))),
            )
            .unwrap();

        // The worker finishes a task strictly after the first rejection.
        let last_task_end = Utc
            .timestamp_millis_opt(old.timestamp + 1)
            .single()
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger
            .append(
                MessageDraft::new("c-1", topics::VALIDATION_RESULT, "validator")
                    .content(MessageContent::data(json!({ "errors": ["B"] }))),
            )
            .unwrap();

        let anchors = ContextAnchors {
            cluster_created_at: Utc.timestamp_millis_opt(0).single().unwrap(),
            last_task_end: Some(last_task_end),
        };
        let prompt = build_prompt(
            &worker_definition(),
            2,
            anchors,
            &ledger,
            OutputFormat::Json,
            None,
        )
        .unwrap();

        assert!(prompt.contains("\"B\""));
        assert!(!prompt.contains("\"A\""));
    }

    #[test]
    fn stream_json_with_schema_appends_output_format_block() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let schema = json!({ "type": "object" });
        let prompt = build_prompt(
            &worker_definition(),
            1,
            ContextAnchors {
                cluster_created_at: Utc::now(),
                last_task_end: None,
            },
            &ledger,
            OutputFormat::StreamJson,
            Some(&schema),
        )
        .unwrap();
        assert!(prompt.contains("OUTPUT FORMAT"));
        assert!(prompt.contains("exactly one JSON object"));

        let without = build_prompt(
            &worker_definition(),
            1,
            ContextAnchors {
                cluster_created_at: Utc::now(),
                last_task_end: None,
            },
            &ledger,
            OutputFormat::Json,
            Some(&schema),
        )
        .unwrap();
        assert!(!without.contains("OUTPUT FORMAT"));
    }

    #[test]
    fn iteration_selects_the_matching_system_prompt() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let mut def = worker_definition();
        def.prompt = Some(PromptSpec::Phased {
            initial: "First pass.".to_string(),
            subsequent: "Apply feedback.".to_string(),
        });
        let anchors = ContextAnchors {
            cluster_created_at: Utc::now(),
            last_task_end: None,
        };
        let first = build_prompt(&def, 1, anchors, &ledger, OutputFormat::Json, None).unwrap();
        let later = build_prompt(&def, 3, anchors, &ledger, OutputFormat::Json, None).unwrap();
        assert!(first.starts_with("First pass."));
        assert!(later.starts_with("Apply feedback."));
    }
}
