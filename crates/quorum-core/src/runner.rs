use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use quorum_types::{ModelLevel, OutputFormat};

/// Callback for streamed runner output. Receives `(chunk, agent_id)`.
pub type OutputSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Everything a runner needs to execute one prompt. The engine never calls
/// a model itself; this is the seam where the external AI CLI plugs in.
#[derive(Clone)]
pub struct RunnerOptions {
    pub agent_id: String,
    pub provider: String,
    pub model: Option<String>,
    pub model_level: Option<ModelLevel>,
    pub reasoning_effort: Option<String>,
    pub output_format: OutputFormat,
    pub json_schema: Option<serde_json::Value>,
    pub strict_schema: bool,
    pub cwd: Option<String>,
    pub on_output: Option<OutputSink>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct RunnerOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub task_id: Option<String>,
}

impl RunnerOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            task_id: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            task_id: None,
        }
    }
}

/// Opaque execution of one prompt. Implementations must honor the
/// cancellation token within a bounded time.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, prompt: &str, opts: RunnerOptions) -> RunnerOutcome;
}
