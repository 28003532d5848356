mod command_runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use command_runner::CommandTaskRunner;
use quorum_core::{ClusterTemplate, ConfigError, Orchestrator, StartOptions, TaskInput};
use quorum_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use quorum_types::{ClusterConfig, Message};

#[derive(Parser, Debug)]
#[command(name = "quorum-engine")]
#[command(about = "Multi-agent coordination engine")]
struct Cli {
    /// State directory; falls back to QUORUM_STATE_DIR, then `.quorum`.
    #[arg(long, global = true)]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a cluster and run it to a terminal state.
    Start {
        /// Cluster config file (JSON with an `agents` list).
        #[arg(long)]
        config: PathBuf,
        /// Template parameters as `name=value` pairs, applied to `--config`.
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Markdown or text file used as the task input.
        #[arg(long, conflicts_with_all = ["text", "issue"])]
        file: Option<PathBuf>,
        /// GitHub issue reference used as the task input.
        #[arg(long, conflicts_with_all = ["text", "file"])]
        issue: Option<String>,
        /// Inline task description.
        #[arg(long)]
        text: Option<String>,
        /// Working directory assigned to agents without an explicit cwd.
        #[arg(long)]
        worktree: Option<String>,
    },
    /// List known clusters.
    List,
    /// Show one cluster's agents and counters.
    Status { cluster_id: String },
    /// Print a cluster's ledger; `--follow` keeps streaming new records.
    Logs {
        cluster_id: String,
        #[arg(long)]
        follow: bool,
    },
    /// Cooperative stop: in-flight tasks finish, nothing new fires.
    Stop { cluster_id: String },
    /// Immediate stop: cancels in-flight tasks.
    Kill { cluster_id: String },
    /// Rebuild a cluster from its ledger and continue.
    Resume { cluster_id: String },
    /// Delete a cluster's ledger and index entry.
    Purge { cluster_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let _log_guard = init_process_logging(ProcessKind::Engine, &logs_dir, 7)
        .context("failed to initialize logging")?;

    let runner = Arc::new(CommandTaskRunner::new(None));
    let orchestrator = Orchestrator::new(&state_dir, runner);

    match run(cli.command, &orchestrator).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Invalid definitions are the one startup failure with a
            // reserved exit code; everything else is a host-level error.
            if err.downcast_ref::<ConfigError>().is_some() {
                eprintln!("config error: {err}");
                std::process::exit(2);
            }
            Err(err)
        }
    }
}

async fn run(command: Command, orchestrator: &Arc<Orchestrator>) -> anyhow::Result<()> {
    match command {
        Command::Start {
            config,
            params,
            file,
            issue,
            text,
            worktree,
        } => {
            let input = match (file, issue, text) {
                (Some(path), None, None) => TaskInput::File(path),
                (None, Some(reference), None) => TaskInput::Issue {
                    body: reference.clone(),
                    reference,
                },
                (None, None, Some(text)) => TaskInput::Text(text),
                _ => anyhow::bail!("exactly one of --file, --issue, or --text is required"),
            };
            let config = load_config(&config, &params)?;
            let options = StartOptions {
                worktree_path: worktree,
                container_id: None,
            };
            let runtime = orchestrator.start(config, input, options).await?;
            let cluster_id = runtime.id();
            println!("cluster {cluster_id} started");

            let mut feed = runtime.bus().feed();
            loop {
                tokio::select! {
                    message = feed.recv() => {
                        if let Ok(message) = message {
                            println!("{}", render_message(&message));
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        if runtime.state().is_terminal() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!(cluster = %cluster_id, "interrupted; stopping cluster");
                        runtime.stop(Some("interrupted".to_string()));
                        break;
                    }
                }
            }
            println!("cluster {cluster_id} finished: {:?}", runtime.state());
        }
        Command::List => {
            for summary in orchestrator.list()? {
                println!(
                    "{}  {:<9}  {} agents  created {}",
                    summary.id,
                    format!("{:?}", summary.state).to_lowercase(),
                    summary.agent_count,
                    summary.created_at.to_rfc3339(),
                );
            }
        }
        Command::Status { cluster_id } => {
            let detail = orchestrator.status(&cluster_id)?;
            println!(
                "{}  {:?}  {} messages",
                detail.summary.id, detail.summary.state, detail.message_count
            );
            for agent in detail.agents {
                println!(
                    "  {:<20} {:<10} iteration {}",
                    agent.id,
                    format!("{:?}", agent.state).to_lowercase(),
                    agent.iteration
                );
            }
        }
        Command::Logs { cluster_id, follow } => {
            let (messages, feed) = orchestrator.logs(&cluster_id)?;
            for message in &messages {
                println!("{}", render_message(message));
            }
            if follow {
                let Some(mut feed) = feed else {
                    anyhow::bail!("cluster `{cluster_id}` is not running; nothing to follow");
                };
                while let Ok(message) = feed.recv().await {
                    println!("{}", render_message(&message));
                }
            }
        }
        Command::Stop { cluster_id } => {
            orchestrator.stop(&cluster_id)?;
            println!("cluster {cluster_id} stopping");
        }
        Command::Kill { cluster_id } => {
            orchestrator.kill(&cluster_id)?;
            println!("cluster {cluster_id} killed");
        }
        Command::Resume { cluster_id } => {
            let runtime = orchestrator.resume(&cluster_id).await?;
            println!("cluster {} resumed", runtime.id());
            loop {
                if runtime.state().is_terminal() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        runtime.stop(Some("interrupted".to_string()));
                        break;
                    }
                }
            }
            println!("cluster {} finished: {:?}", runtime.id(), runtime.state());
        }
        Command::Purge { cluster_id } => {
            orchestrator.purge(&cluster_id)?;
            println!("cluster {cluster_id} purged");
        }
    }
    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("QUORUM_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".quorum")
}

/// Load a cluster config, treating `--param` pairs as template parameters
/// when present.
fn load_config(path: &PathBuf, params: &[String]) -> anyhow::Result<ClusterConfig> {
    if params.is_empty() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: ClusterConfig =
            serde_json::from_str(&raw).map_err(|err| anyhow::Error::new(ConfigError::Shape(err)))?;
        quorum_core::validate_config(&config)
            .map_err(|err| anyhow::Error::new(ConfigError::Template(err)))?;
        return Ok(config);
    }
    let mut map = Map::new();
    for pair in params {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("--param `{pair}` is not NAME=VALUE"))?;
        // Values parse as JSON when they can, so numbers and arrays keep
        // their types; everything else is a string.
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(name.to_string(), value);
    }
    let template = ClusterTemplate::from_file(path, map)
        .map_err(|err| anyhow::Error::new(ConfigError::Template(err)))?;
    template
        .resolve()
        .map_err(|err| anyhow::Error::new(ConfigError::Template(err)))
}

fn render_message(message: &Message) -> String {
    let when = Utc
        .timestamp_millis_opt(message.timestamp)
        .single()
        .map(|ts| ts.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| message.timestamp.to_string());
    let mut line = format!(
        "[{}] {:<20} {} -> {}",
        when, message.topic, message.sender, message.receiver
    );
    if let Some(text) = &message.content.text {
        let first_line = text.lines().next().unwrap_or_default();
        line.push_str(&format!("  {first_line}"));
    }
    if let Some(data) = &message.content.data {
        line.push_str(&format!("  {data}"));
    }
    line
}
