pub mod agent;
pub mod bus;
pub mod cluster;
pub mod context;
pub mod hooks;
pub mod input;
pub mod logic;
pub mod orchestrator;
pub mod runner;
pub mod schema;
pub mod settings;
pub mod template;

pub use agent::{select_model, AgentRuntime, ModelChoice, ModelPolicyError};
pub use bus::{MessageBus, SubscriptionGuard};
pub use cluster::ClusterRuntime;
pub use context::{build_prompt, ContextAnchors};
pub use hooks::{run_hooks, HookError, HookHost};
pub use input::TaskInput;
pub use logic::{evaluate, LogicError, LogicHost, EVAL_BUDGET};
pub use orchestrator::{ConfigError, Orchestrator, StartOptions};
pub use runner::{OutputSink, RunnerOptions, RunnerOutcome, TaskRunner};
pub use schema::{normalize_enums, parse_output, validate, SchemaError};
pub use settings::SettingsStore;
pub use template::{validate_config, ClusterTemplate, TemplateError};
