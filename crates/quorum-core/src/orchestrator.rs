use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use quorum_ledger::{ClusterIndex, Ledger, MessageFilter};
use quorum_types::{
    topics, AgentState, AgentStatus, ClusterConfig, ClusterDetail, ClusterRecord, ClusterState,
    ClusterSummary, Message,
};

use crate::cluster::ClusterRuntime;
use crate::input::TaskInput;
use crate::runner::TaskRunner;
use crate::settings::SettingsStore;
use crate::template::{validate_config, ClusterTemplate, TemplateError};

/// Invalid cluster or agent definitions are fatal at start: reported to the
/// caller, never published to any ledger.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("config is not a valid cluster definition: {0}")]
    Shape(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub worktree_path: Option<String>,
    pub container_id: Option<String>,
}

/// The cluster table. Creates, resumes, and tears down clusters; everything
/// else happens inside each cluster's own runtime.
pub struct Orchestrator {
    state_dir: PathBuf,
    settings: SettingsStore,
    index: ClusterIndex,
    runner: Arc<dyn TaskRunner>,
    clusters: RwLock<HashMap<String, Arc<ClusterRuntime>>>,
}

impl Orchestrator {
    pub fn new(state_dir: impl Into<PathBuf>, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        let state_dir = state_dir.into();
        Arc::new(Self {
            settings: SettingsStore::new(&state_dir),
            index: ClusterIndex::new(&state_dir),
            state_dir,
            runner,
            clusters: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<Arc<ClusterRuntime>> {
        self.clusters
            .read()
            .expect("cluster table poisoned")
            .get(cluster_id)
            .cloned()
    }

    // -----------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------

    pub async fn start(
        self: &Arc<Self>,
        config: ClusterConfig,
        input: TaskInput,
        options: StartOptions,
    ) -> anyhow::Result<Arc<ClusterRuntime>> {
        validate_config(&config).map_err(ConfigError::from)?;

        let record = ClusterRecord {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state: ClusterState::Running,
            config,
            worktree_path: options.worktree_path,
            container_id: options.container_id,
        };
        let seed = input.seed_draft(&record.id)?;

        let ledger = Arc::new(Ledger::open(&self.state_dir, &record.id)?);
        let runtime = ClusterRuntime::new(
            record.clone(),
            ledger,
            self.settings.clone(),
            self.runner.clone(),
            self.index.clone(),
        );
        for definition in &record.config.agents {
            runtime.register_agent(definition.clone());
        }
        // Persist with inherited cwds applied.
        self.index.upsert(&runtime.record())?;
        runtime.attach(self);
        self.clusters
            .write()
            .expect("cluster table poisoned")
            .insert(record.id.clone(), runtime.clone());

        // Misconfigured model ladders surface before any task runs.
        runtime.publish_model_policy_errors();

        runtime
            .bus()
            .publish(seed)
            .context("failed to seed cluster input")?;
        tracing::info!(cluster = %record.id, "cluster started");
        Ok(runtime)
    }

    pub async fn start_template(
        self: &Arc<Self>,
        template: ClusterTemplate,
        input: TaskInput,
        options: StartOptions,
    ) -> anyhow::Result<Arc<ClusterRuntime>> {
        let config = template.resolve().map_err(ConfigError::from)?;
        self.start(config, input, options).await
    }

    /// Start from a raw JSON cluster definition, as sub-cluster hooks do.
    pub async fn start_from_value(
        self: &Arc<Self>,
        config: serde_json::Value,
        input: TaskInput,
    ) -> anyhow::Result<Arc<ClusterRuntime>> {
        let config: ClusterConfig =
            serde_json::from_value(config).map_err(ConfigError::from)?;
        self.start(config, input, StartOptions::default()).await
    }

    // -----------------------------------------------------------------
    // Read-only surfaces
    // -----------------------------------------------------------------

    pub fn list(&self) -> anyhow::Result<Vec<ClusterSummary>> {
        Ok(self.index.list()?)
    }

    pub fn status(&self, cluster_id: &str) -> anyhow::Result<ClusterDetail> {
        if let Some(runtime) = self.cluster(cluster_id) {
            return Ok(runtime.detail());
        }
        // Cold read: derive agent state from the ledger's task brackets.
        let record = self.require_record(cluster_id)?;
        let ledger = Ledger::open(&self.state_dir, cluster_id)?;
        let agents = record
            .config
            .agents
            .iter()
            .map(|definition| {
                let iteration = ledger
                    .count(
                        &MessageFilter::topic(topics::TASK_STARTED)
                            .sender(definition.id.clone()),
                    )
                    .unwrap_or(0) as u32;
                AgentStatus {
                    id: definition.id.clone(),
                    role: definition.role.clone(),
                    state: AgentState::Idle,
                    iteration,
                    last_task_end_time: None,
                    in_flight_task_id: None,
                }
            })
            .collect();
        let message_count = ledger.count(&MessageFilter::default())?;
        Ok(ClusterDetail {
            summary: ClusterSummary::from(&record),
            agents,
            message_count,
        })
    }

    /// Stored messages plus, for a loaded cluster, a live feed receiver.
    pub fn logs(
        &self,
        cluster_id: &str,
    ) -> anyhow::Result<(Vec<Message>, Option<broadcast::Receiver<Message>>)> {
        if let Some(runtime) = self.cluster(cluster_id) {
            let messages = runtime.ledger().query(&MessageFilter::default())?;
            return Ok((messages, Some(runtime.bus().feed())));
        }
        self.require_record(cluster_id)?;
        let ledger = Ledger::open(&self.state_dir, cluster_id)?;
        let messages = ledger.query(&MessageFilter::default())?;
        Ok((messages, None))
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    pub fn stop(&self, cluster_id: &str) -> anyhow::Result<()> {
        if let Some(runtime) = self.cluster(cluster_id) {
            runtime.stop(None);
            return Ok(());
        }
        self.require_record(cluster_id)?;
        self.index.set_state(cluster_id, ClusterState::Stopped)?;
        Ok(())
    }

    pub fn kill(&self, cluster_id: &str) -> anyhow::Result<()> {
        if let Some(runtime) = self.cluster(cluster_id) {
            runtime.kill();
            return Ok(());
        }
        self.require_record(cluster_id)?;
        self.index.set_state(cluster_id, ClusterState::Stopped)?;
        Ok(())
    }

    /// Rebuild a cluster from its persisted record and ledger. Iterations
    /// come from counting historical task brackets; definitions that
    /// predate cwd inheritance are repaired through the same default
    /// chain. Past triggers are not replayed.
    pub async fn resume(self: &Arc<Self>, cluster_id: &str) -> anyhow::Result<Arc<ClusterRuntime>> {
        if let Some(runtime) = self.cluster(cluster_id) {
            return Ok(runtime);
        }
        let mut record = self.require_record(cluster_id)?;
        record.state = ClusterState::Running;

        let ledger = Arc::new(Ledger::open(&self.state_dir, cluster_id)?);
        let runtime = ClusterRuntime::new(
            record.clone(),
            ledger,
            self.settings.clone(),
            self.runner.clone(),
            self.index.clone(),
        );
        for definition in &record.config.agents {
            runtime.register_agent(definition.clone());
        }
        runtime.restore_from_ledger();
        self.index.upsert(&runtime.record())?;
        runtime.attach(self);
        self.clusters
            .write()
            .expect("cluster table poisoned")
            .insert(cluster_id.to_string(), runtime.clone());
        tracing::info!(cluster = cluster_id, "cluster resumed");
        Ok(runtime)
    }

    /// Delete a cluster's ledger and index entry. Running clusters are
    /// killed first.
    pub fn purge(&self, cluster_id: &str) -> anyhow::Result<()> {
        if let Some(runtime) = self
            .clusters
            .write()
            .expect("cluster table poisoned")
            .remove(cluster_id)
        {
            runtime.kill();
        }
        self.index.remove(cluster_id)?;
        Ledger::purge(&self.state_dir, cluster_id)?;
        Ok(())
    }

    fn require_record(&self, cluster_id: &str) -> anyhow::Result<ClusterRecord> {
        self.index
            .get(cluster_id)?
            .ok_or_else(|| quorum_ledger::LedgerError::UnknownCluster(cluster_id.to_string()))
            .map_err(Into::into)
    }
}
