use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use quorum_core::{RunnerOptions, RunnerOutcome, TaskRunner};
use quorum_types::OutputFormat;

/// Task runner that shells out to an AI CLI: the prompt goes to stdin, the
/// reply comes back on stdout. The provider command is taken from
/// `QUORUM_PROVIDER_CMD` (defaulting to the provider name itself), so any
/// CLI with a `-p/--model/--output-format` surface can be dropped in.
pub struct CommandTaskRunner {
    program: Option<String>,
}

impl CommandTaskRunner {
    pub fn new(program: Option<String>) -> Self {
        Self { program }
    }

    fn resolve_program(&self, provider: &str) -> String {
        if let Some(program) = &self.program {
            return program.clone();
        }
        std::env::var("QUORUM_PROVIDER_CMD").unwrap_or_else(|_| provider.to_string())
    }
}

#[async_trait::async_trait]
impl TaskRunner for CommandTaskRunner {
    async fn run(&self, prompt: &str, opts: RunnerOptions) -> RunnerOutcome {
        let program = self.resolve_program(&opts.provider);
        let mut command = Command::new(&program);
        command
            .arg("-p")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &opts.model {
            command.args(["--model", model]);
        }
        match opts.output_format {
            OutputFormat::Text => {}
            OutputFormat::Json => {
                command.args(["--output-format", "json"]);
            }
            OutputFormat::StreamJson => {
                command.args(["--output-format", "stream-json"]);
            }
        }
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return RunnerOutcome::failed(format!("failed to spawn `{program}`: {err}"));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                return RunnerOutcome::failed(format!("failed to write prompt: {err}"));
            }
            drop(stdin);
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let agent_id = opts.agent_id.clone();
        let on_output = opts.on_output.clone();

        let wait = async {
            let mut out = String::new();
            if let Some(stream) = stdout.as_mut() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            if let Some(sink) = &on_output {
                                sink(&chunk, &agent_id);
                            }
                            out.push_str(&chunk);
                        }
                        Err(_) => break,
                    }
                }
            }
            let mut err_out = String::new();
            if let Some(stream) = stderr.as_mut() {
                let _ = stream.read_to_string(&mut err_out).await;
            }
            let status = child.wait().await;
            (out, err_out, status)
        };

        tokio::select! {
            (out, err_out, status) = wait => match status {
                Ok(status) if status.success() => RunnerOutcome {
                    success: true,
                    output: out,
                    error: None,
                    task_id: None,
                },
                Ok(status) => RunnerOutcome {
                    success: false,
                    output: out,
                    error: Some(format!(
                        "`{program}` exited with {status}: {}",
                        err_out.trim()
                    )),
                    task_id: None,
                },
                Err(err) => RunnerOutcome::failed(format!("failed to await `{program}`: {err}")),
            },
            _ = opts.cancel.cancelled() => {
                RunnerOutcome::failed("task cancelled".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::ModelLevel;
    use tokio_util::sync::CancellationToken;

    fn options() -> RunnerOptions {
        RunnerOptions {
            agent_id: "worker".to_string(),
            provider: "cat".to_string(),
            model: None,
            model_level: Some(ModelLevel::Level2),
            reasoning_effort: None,
            output_format: OutputFormat::Text,
            json_schema: None,
            strict_schema: false,
            cwd: None,
            on_output: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn pipes_prompt_to_stdin_and_captures_stdout() {
        // `sh -p` executes the prompt as a script from stdin.
        let runner = CommandTaskRunner::new(Some("sh".to_string()));
        let outcome = runner.run("echo hello runner", options()).await;
        assert!(outcome.success, "error: {:?}", outcome.error);
        assert!(outcome.output.contains("hello runner"));
    }

    #[tokio::test]
    async fn missing_program_fails_cleanly() {
        let runner = CommandTaskRunner::new(Some("definitely-not-a-real-binary".to_string()));
        let outcome = runner.run("x", options()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn failing_child_reports_stderr() {
        let runner = CommandTaskRunner::new(Some("sh".to_string()));
        let outcome = runner.run("echo boom >&2; exit 3", options()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_child() {
        let runner = CommandTaskRunner::new(Some("sh".to_string()));
        let mut opts = options();
        let cancel = CancellationToken::new();
        opts.cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.run("sleep 30", opts).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("cancelled"));
    }
}
