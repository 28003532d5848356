use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::message::MessageContent;
use crate::settings::ModelLevel;

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_STALE_DURATION_MS: u64 = 30 * 60 * 1000;

/// Iteration selector used by model rules and iteration-matched prompts:
/// `"3"` exact, `"2-4"` inclusive range, `"5+"` open-ended, `"all"` always.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationPattern {
    Exact(u32),
    Range(u32, u32),
    From(u32),
    All,
}

impl IterationPattern {
    pub fn matches(&self, iteration: u32) -> bool {
        match self {
            IterationPattern::Exact(n) => iteration == *n,
            IterationPattern::Range(lo, hi) => iteration >= *lo && iteration <= *hi,
            IterationPattern::From(n) => iteration >= *n,
            IterationPattern::All => true,
        }
    }
}

impl FromStr for IterationPattern {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(IterationPattern::All);
        }
        if let Some(base) = trimmed.strip_suffix('+') {
            let n = base
                .parse::<u32>()
                .map_err(|_| format!("invalid iteration pattern `{raw}`"))?;
            return Ok(IterationPattern::From(n));
        }
        if let Some((lo, hi)) = trimmed.split_once('-') {
            let lo = lo
                .parse::<u32>()
                .map_err(|_| format!("invalid iteration pattern `{raw}`"))?;
            let hi = hi
                .parse::<u32>()
                .map_err(|_| format!("invalid iteration pattern `{raw}`"))?;
            if lo > hi {
                return Err(format!("empty iteration range `{raw}`"));
            }
            return Ok(IterationPattern::Range(lo, hi));
        }
        trimmed
            .parse::<u32>()
            .map(IterationPattern::Exact)
            .map_err(|_| format!("invalid iteration pattern `{raw}`"))
    }
}

impl fmt::Display for IterationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationPattern::Exact(n) => write!(f, "{n}"),
            IterationPattern::Range(lo, hi) => write!(f, "{lo}-{hi}"),
            IterationPattern::From(n) => write!(f, "{n}+"),
            IterationPattern::All => write!(f, "all"),
        }
    }
}

impl Serialize for IterationPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IterationPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationPrompt {
    #[serde(rename = "match")]
    pub pattern: IterationPattern,
    pub system: String,
}

/// An agent's system prompt: one string for every iteration, an
/// initial/subsequent pair, or a list matched by iteration pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PromptSpec {
    Static(String),
    Phased { initial: String, subsequent: String },
    Iterations { iterations: Vec<IterationPrompt> },
}

impl PromptSpec {
    /// Select the system prompt for the given 1-based iteration, if any
    /// variant matches.
    pub fn select(&self, iteration: u32) -> Option<&str> {
        match self {
            PromptSpec::Static(s) => Some(s.as_str()),
            PromptSpec::Phased {
                initial,
                subsequent,
            } => Some(if iteration <= 1 { initial } else { subsequent }.as_str()),
            PromptSpec::Iterations { iterations } => iterations
                .iter()
                .find(|p| p.pattern.matches(iteration))
                .map(|p| p.system.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    ExecuteTask,
    StopCluster,
    PublishMessage,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerFilter {
    #[serde(default = "default_true")]
    pub exclude_republished: bool,
}

impl Default for TriggerFilter {
    fn default() -> Self {
        Self {
            exclude_republished: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub topic: String,
    /// Predicate in the sandboxed trigger expression language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<String>,
    pub action: TriggerAction,
    /// Action payload, e.g. the message to publish for `publish_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default)]
    pub filter: TriggerFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    PublishMessage {
        topic: String,
        #[serde(default)]
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },
    StopCluster {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SpawnSubCluster {
        config: Value,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_for_topic: Option<String>,
    },
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentHooks {
    #[serde(default)]
    pub on_start: Vec<HookAction>,
    #[serde(default)]
    pub on_complete: Vec<HookAction>,
    #[serde(default)]
    pub on_error: Vec<HookAction>,
}

/// Anchor for a context source's `since` bound.
#[derive(Debug, Clone, PartialEq)]
pub enum SinceSpec {
    ClusterStart,
    LastTaskEnd,
    At(DateTime<Utc>),
}

impl Serialize for SinceSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SinceSpec::ClusterStart => serializer.serialize_str("cluster_start"),
            SinceSpec::LastTaskEnd => serializer.serialize_str("last_task_end"),
            SinceSpec::At(ts) => serializer.serialize_str(&ts.to_rfc3339()),
        }
    }
}

impl<'de> Deserialize<'de> for SinceSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "cluster_start" => Ok(SinceSpec::ClusterStart),
            "last_task_end" => Ok(SinceSpec::LastTaskEnd),
            other => DateTime::parse_from_rfc3339(other)
                .map(|ts| SinceSpec::At(ts.with_timezone(&Utc)))
                .map_err(|_| {
                    de::Error::custom(format!(
                        "`since` must be cluster_start, last_task_end, or an ISO-8601 time, got `{other}`"
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<SinceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextStrategy {
    #[serde(default)]
    pub sources: Vec<ContextSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRule {
    pub iterations: IterationPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_level: Option<ModelLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelConfig {
    Static {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_level: Option<ModelLevel>,
    },
    Rules {
        rules: Vec<ModelRule>,
    },
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::Static {
            model: None,
            model_level: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Text,
    #[default]
    Json,
    StreamJson,
}

/// The minimal output schema used when an agent declares none.
pub fn default_json_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "result": { "type": "string" }
        },
        "required": ["summary"]
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptSpec>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub hooks: AgentHooks,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    #[serde(default)]
    pub model_config: ModelConfig,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
    #[serde(default = "default_true")]
    pub strict_schema: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_stale_duration_ms")]
    pub stale_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_stale_duration_ms() -> u64 {
    DEFAULT_STALE_DURATION_MS
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: String::new(),
            prompt: None,
            triggers: Vec::new(),
            hooks: AgentHooks::default(),
            context_strategy: ContextStrategy::default(),
            model_config: ModelConfig::default(),
            output_format: OutputFormat::default(),
            json_schema: None,
            strict_schema: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout_ms: 0,
            stale_duration_ms: DEFAULT_STALE_DURATION_MS,
            cwd: None,
        }
    }

    /// Validators get fatal schema enforcement; everyone else gets warnings.
    pub fn is_validator(&self) -> bool {
        self.role.eq_ignore_ascii_case("validator")
    }

    /// The schema the agent's output is validated against.
    pub fn effective_schema(&self) -> Value {
        self.json_schema.clone().unwrap_or_else(default_json_schema)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Evaluating,
    Executing,
}

/// Read-only snapshot of an agent's runtime state, surfaced by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: String,
    pub role: String,
    pub state: AgentState,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_task_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_patterns_parse_and_match() {
        let exact: IterationPattern = "1".parse().unwrap();
        let range: IterationPattern = "2-4".parse().unwrap();
        let open: IterationPattern = "5+".parse().unwrap();
        let all: IterationPattern = "all".parse().unwrap();

        assert!(exact.matches(1));
        assert!(!exact.matches(2));
        assert!(range.matches(2) && range.matches(4));
        assert!(!range.matches(5));
        assert!(open.matches(5) && open.matches(100));
        assert!(!open.matches(4));
        assert!(all.matches(1) && all.matches(999));
    }

    #[test]
    fn iteration_pattern_rejects_garbage() {
        assert!("".parse::<IterationPattern>().is_err());
        assert!("x".parse::<IterationPattern>().is_err());
        assert!("4-2".parse::<IterationPattern>().is_err());
    }

    #[test]
    fn iteration_pattern_round_trips_through_serde() {
        for raw in ["1", "2-4", "5+", "all"] {
            let pattern: IterationPattern = serde_json::from_value(json!(raw)).unwrap();
            assert_eq!(serde_json::to_value(&pattern).unwrap(), json!(raw));
        }
    }

    #[test]
    fn prompt_spec_selects_by_iteration() {
        let phased = PromptSpec::Phased {
            initial: "first".to_string(),
            subsequent: "later".to_string(),
        };
        assert_eq!(phased.select(1), Some("first"));
        assert_eq!(phased.select(2), Some("later"));

        let matched = PromptSpec::Iterations {
            iterations: vec![
                IterationPrompt {
                    pattern: "1-2".parse().unwrap(),
                    system: "warmup".to_string(),
                },
                IterationPrompt {
                    pattern: "3+".parse().unwrap(),
                    system: "steady".to_string(),
                },
            ],
        };
        assert_eq!(matched.select(2), Some("warmup"));
        assert_eq!(matched.select(7), Some("steady"));
    }

    #[test]
    fn prompt_spec_deserializes_all_shapes() {
        let shapes = json!([
            "just a string",
            { "initial": "a", "subsequent": "b" },
            { "iterations": [{ "match": "all", "system": "s" }] }
        ]);
        let parsed: Vec<PromptSpec> = serde_json::from_value(shapes).unwrap();
        assert!(matches!(parsed[0], PromptSpec::Static(_)));
        assert!(matches!(parsed[1], PromptSpec::Phased { .. }));
        assert!(matches!(parsed[2], PromptSpec::Iterations { .. }));
    }

    #[test]
    fn trigger_filter_excludes_republished_by_default() {
        let spec: TriggerSpec = serde_json::from_value(json!({
            "topic": "ISSUE_OPENED",
            "action": "execute_task"
        }))
        .unwrap();
        assert!(spec.filter.exclude_republished);
    }

    #[test]
    fn since_spec_parses_named_anchors_and_iso_times() {
        let named: SinceSpec = serde_json::from_value(json!("cluster_start")).unwrap();
        assert_eq!(named, SinceSpec::ClusterStart);
        let iso: SinceSpec = serde_json::from_value(json!("2026-01-02T03:04:05Z")).unwrap();
        assert!(matches!(iso, SinceSpec::At(_)));
        assert!(serde_json::from_value::<SinceSpec>(json!("yesterday")).is_err());
    }

    #[test]
    fn agent_definition_defaults() {
        let def: AgentDefinition = serde_json::from_value(json!({ "id": "worker" })).unwrap();
        assert_eq!(def.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(def.stale_duration_ms, DEFAULT_STALE_DURATION_MS);
        assert_eq!(def.timeout_ms, 0);
        assert!(def.strict_schema);
        assert_eq!(def.output_format, OutputFormat::Json);
        let schema = def.effective_schema();
        assert!(schema["properties"]["summary"].is_object());
    }
}
