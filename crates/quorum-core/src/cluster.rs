use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use quorum_ledger::{ClusterIndex, Ledger, MessageFilter};
use quorum_observability::{emit_event, ObservabilityEvent, ProcessKind};
use quorum_types::{
    error_codes, topics, AgentDefinition, ClusterDetail, ClusterOperation, ClusterOperations,
    ClusterRecord, ClusterState, ClusterSummary, Message, MessageContent, MessageDraft,
    OutputFormat, SENDER_SYSTEM,
};

use crate::agent::{model_rule_violations, select_model, AgentRuntime, TaskBegin};
use crate::bus::{MessageBus, SubscriptionGuard};
use crate::context::{build_prompt, ContextAnchors};
use crate::hooks::{run_hooks, HookError, HookHost};
use crate::logic::{self, LogicError, LogicHost};
use crate::orchestrator::Orchestrator;
use crate::runner::{RunnerOptions, RunnerOutcome, TaskRunner};
use crate::schema::{normalize_enums, parse_output, validate, SchemaError};
use crate::settings::SettingsStore;

const SUB_CLUSTER_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, PartialEq)]
enum Dispatch {
    NoMatch,
    Fired,
    Deferred,
}

/// One running cluster: its persisted record, ledger, bus, and agent table.
/// All cross-agent communication flows through the ledger; agents never
/// hold direct handles to one another.
pub struct ClusterRuntime {
    record: RwLock<ClusterRecord>,
    ledger: Arc<Ledger>,
    bus: MessageBus,
    agents: RwLock<Vec<Arc<AgentRuntime>>>,
    cancel: CancellationToken,
    settings: SettingsStore,
    runner: Arc<dyn TaskRunner>,
    index: ClusterIndex,
    orchestrator: Mutex<Weak<Orchestrator>>,
    /// `(agent_id, trigger_index, message_id)` triples that already fired.
    fired: Mutex<HashSet<(String, usize, String)>>,
    /// Triggers waiting for their agent's executing slot, in ledger order.
    deferred: Mutex<VecDeque<(String, Message)>>,
    subscription: Mutex<Option<SubscriptionGuard>>,
}

impl std::fmt::Debug for ClusterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRuntime").finish_non_exhaustive()
    }
}

impl ClusterRuntime {
    pub fn new(
        record: ClusterRecord,
        ledger: Arc<Ledger>,
        settings: SettingsStore,
        runner: Arc<dyn TaskRunner>,
        index: ClusterIndex,
    ) -> Arc<Self> {
        let bus = MessageBus::new(record.id.clone(), ledger.clone());
        Arc::new(Self {
            record: RwLock::new(record),
            ledger,
            bus,
            agents: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            settings,
            runner,
            index,
            orchestrator: Mutex::new(Weak::new()),
            fired: Mutex::new(HashSet::new()),
            deferred: Mutex::new(VecDeque::new()),
            subscription: Mutex::new(None),
        })
    }

    /// Wire the runtime into its orchestrator and start receiving messages.
    pub fn attach(self: &Arc<Self>, orchestrator: &Arc<Orchestrator>) {
        *self.orchestrator.lock().expect("orchestrator weak poisoned") =
            Arc::downgrade(orchestrator);
        let weak = Arc::downgrade(self);
        let guard = self.bus.subscribe_all(Arc::new(move |message| {
            if let Some(runtime) = weak.upgrade() {
                runtime.handle_message(message);
            }
        }));
        *self.subscription.lock().expect("subscription poisoned") = Some(guard);
    }

    pub fn id(&self) -> String {
        self.record.read().expect("record poisoned").id.clone()
    }

    pub fn record(&self) -> ClusterRecord {
        self.record.read().expect("record poisoned").clone()
    }

    pub fn state(&self) -> ClusterState {
        self.record.read().expect("record poisoned").state
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        self.agents
            .read()
            .expect("agents poisoned")
            .iter()
            .find(|agent| agent.id() == agent_id)
            .cloned()
    }

    fn agents_snapshot(&self) -> Vec<Arc<AgentRuntime>> {
        self.agents.read().expect("agents poisoned").clone()
    }

    /// Register an agent, applying the working-directory inheritance chain:
    /// explicit `cwd`, then the cluster worktree, then the process cwd.
    pub fn register_agent(&self, definition: AgentDefinition) -> Arc<AgentRuntime> {
        let agent = Arc::new(AgentRuntime::new(definition));
        if let Some(cwd) = self.inherited_cwd() {
            agent.inherit_cwd(&cwd);
        }
        self.agents
            .write()
            .expect("agents poisoned")
            .push(agent.clone());
        agent
    }

    fn inherited_cwd(&self) -> Option<String> {
        let record = self.record.read().expect("record poisoned");
        if let Some(worktree) = &record.worktree_path {
            return Some(worktree.clone());
        }
        drop(record);
        std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string())
    }

    pub fn detail(&self) -> ClusterDetail {
        let record = self.record();
        let agents = self
            .agents_snapshot()
            .iter()
            .map(|agent| agent.status())
            .collect();
        let message_count = self.ledger.count(&MessageFilter::default()).unwrap_or(0);
        ClusterDetail {
            summary: ClusterSummary::from(&record),
            agents,
            message_count,
        }
    }

    // -----------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------

    fn set_state(&self, state: ClusterState) {
        {
            let mut record = self.record.write().expect("record poisoned");
            if record.state.is_terminal() {
                return;
            }
            record.state = state;
        }
        let cluster_id = self.id();
        if let Err(err) = self.index.set_state(&cluster_id, state) {
            tracing::warn!(cluster = %cluster_id, error = %err, "failed to persist cluster state");
        }
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "cluster.state",
                component: "cluster.runtime",
                cluster_id: Some(cluster_id.as_str()),
                status: Some(match state {
                    ClusterState::Running => "running",
                    ClusterState::Stopped => "stopped",
                    ClusterState::Failed => "failed",
                    ClusterState::Completed => "completed",
                }),
                ..ObservabilityEvent::default()
            },
        );
    }

    /// Cooperative stop: no new trigger firings, in-flight tasks finish.
    pub fn stop(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            tracing::info!(cluster = %self.id(), reason, "cluster stopping");
        }
        self.set_state(ClusterState::Stopped);
    }

    /// Immediate stop: cancels in-flight tasks through the cluster token.
    pub fn kill(&self) {
        self.set_state(ClusterState::Stopped);
        self.cancel.cancel();
    }

    pub fn complete(&self) {
        self.set_state(ClusterState::Completed);
    }

    pub fn fail(&self) {
        self.set_state(ClusterState::Failed);
        self.cancel.cancel();
    }

    // -----------------------------------------------------------------
    // Message dispatch
    // -----------------------------------------------------------------

    fn handle_message(self: &Arc<Self>, message: &Message) {
        match message.topic.as_str() {
            topics::STOP_CLUSTER => {
                let reason = message
                    .content
                    .data
                    .as_ref()
                    .and_then(|d| d.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.stop(reason);
                return;
            }
            topics::CLUSTER_COMPLETE => {
                self.complete();
                return;
            }
            _ => {}
        }

        if self.state().is_terminal() {
            return;
        }

        if message.topic == topics::CLUSTER_OPERATIONS {
            self.apply_operations(message);
        }

        for agent in self.agents_snapshot() {
            let agent_id = agent.id();
            if !message.addressed_to(&agent_id) {
                continue;
            }
            if self.dispatch_to_agent(&agent, message) == Dispatch::Deferred {
                self.deferred
                    .lock()
                    .expect("deferred poisoned")
                    .push_back((agent_id, message.clone()));
            }
        }
    }

    /// Evaluate an agent's triggers against one message in declared order;
    /// the first trigger that matches wins.
    fn dispatch_to_agent(self: &Arc<Self>, agent: &Arc<AgentRuntime>, message: &Message) -> Dispatch {
        let definition = agent.definition();
        for (index, trigger) in definition.triggers.iter().enumerate() {
            if trigger.topic != message.topic {
                continue;
            }
            if trigger.filter.exclude_republished && message.is_republished() {
                continue;
            }
            let key = (definition.id.clone(), index, message.id.clone());
            if self.fired.lock().expect("fired poisoned").contains(&key) {
                continue;
            }
            if let Some(source) = &trigger.logic {
                let view = LogicView {
                    runtime: self.as_ref(),
                    message,
                };
                match logic::evaluate(source, &view) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(LogicError::Budget) => {
                        tracing::warn!(
                            agent = %definition.id,
                            trigger = index,
                            "trigger logic exceeded its budget; treating as false"
                        );
                        continue;
                    }
                    Err(err) => {
                        let draft = MessageDraft::new(
                            self.id(),
                            topics::LOGIC_ERROR,
                            SENDER_SYSTEM,
                        )
                        .content(MessageContent::data(json!({
                            "agent": definition.id,
                            "trigger_index": index,
                            "message_id": message.id,
                            "error": err.to_string(),
                        })));
                        if let Err(publish_err) = self.bus.publish(draft) {
                            tracing::error!(error = %publish_err, "failed to publish LOGIC_ERROR");
                        }
                        continue;
                    }
                }
            }

            use quorum_types::TriggerAction::*;
            match trigger.action {
                ExecuteTask => match agent.try_begin() {
                    TaskBegin::Begun { iteration, task_id } => {
                        self.mark_fired(key);
                        let runtime = self.clone();
                        let agent = agent.clone();
                        let message = message.clone();
                        tokio::spawn(async move {
                            runtime.run_task(agent, message, iteration, task_id).await;
                        });
                        return Dispatch::Fired;
                    }
                    TaskBegin::Busy => return Dispatch::Deferred,
                    TaskBegin::Halted { first_time } => {
                        self.mark_fired(key);
                        if first_time {
                            let draft = MessageDraft::new(
                                self.id(),
                                topics::AGENT_HALTED,
                                definition.id.clone(),
                            )
                            .content(MessageContent::data(json!({
                                "max_iterations": definition.max_iterations,
                            })));
                            if let Err(err) = self.bus.publish(draft) {
                                tracing::error!(error = %err, "failed to publish AGENT_HALTED");
                            }
                        }
                        return Dispatch::Fired;
                    }
                },
                PublishMessage => {
                    self.mark_fired(key);
                    self.publish_from_trigger_config(&definition.id, trigger.config.as_ref());
                    return Dispatch::Fired;
                }
                StopCluster => {
                    self.mark_fired(key);
                    let reason = trigger
                        .config
                        .as_ref()
                        .and_then(|c| c.get("reason"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    self.stop(reason);
                    return Dispatch::Fired;
                }
                Noop => {
                    self.mark_fired(key);
                    return Dispatch::Fired;
                }
            }
        }
        Dispatch::NoMatch
    }

    fn mark_fired(&self, key: (String, usize, String)) {
        self.fired.lock().expect("fired poisoned").insert(key);
    }

    fn publish_from_trigger_config(&self, agent_id: &str, config: Option<&Value>) {
        let Some(topic) = config
            .and_then(|c| c.get("topic"))
            .and_then(Value::as_str)
        else {
            tracing::warn!(agent = agent_id, "publish_message trigger without a topic");
            return;
        };
        let mut draft = MessageDraft::new(self.id(), topic, agent_id);
        if let Some(content) = config.and_then(|c| c.get("content")) {
            if let Ok(content) = serde_json::from_value::<MessageContent>(content.clone()) {
                draft = draft.content(content);
            }
        }
        if let Some(metadata) = config
            .and_then(|c| c.get("metadata"))
            .and_then(Value::as_object)
        {
            for (key, value) in metadata {
                draft = draft.meta(key.clone(), value.clone());
            }
        }
        if let Err(err) = self.bus.publish(draft) {
            tracing::error!(agent = agent_id, error = %err, "trigger publish failed");
        }
    }

    /// Re-attempt deferred triggers for an agent that just went idle, in
    /// the order their messages hit the ledger.
    fn drain_deferred(self: &Arc<Self>, agent_id: &str) {
        loop {
            let next = {
                let mut queue = self.deferred.lock().expect("deferred poisoned");
                let position = queue.iter().position(|(id, _)| id == agent_id);
                position.and_then(|pos| queue.remove(pos))
            };
            let Some((_, message)) = next else {
                return;
            };
            let Some(agent) = self.agent(agent_id) else {
                return;
            };
            if self.dispatch_to_agent(&agent, &message) == Dispatch::Deferred {
                self.deferred
                    .lock()
                    .expect("deferred poisoned")
                    .push_front((agent_id.to_string(), message));
                return;
            }
        }
    }

    // -----------------------------------------------------------------
    // Cluster operations
    // -----------------------------------------------------------------

    fn apply_operations(self: &Arc<Self>, message: &Message) {
        let payload = message.content.data.clone().unwrap_or(Value::Null);
        let operations = match ClusterOperations::from_payload(&payload) {
            Ok(ops) => ops,
            Err(err) => {
                tracing::warn!(cluster = %self.id(), error = %err, "rejected cluster operations");
                let draft = MessageDraft::new(self.id(), topics::HOOK_ERROR, SENDER_SYSTEM)
                    .content(MessageContent::data(json!({
                        "action": "cluster_operations",
                        "message_id": message.id,
                        "error": err,
                    })));
                if let Err(publish_err) = self.bus.publish(draft) {
                    tracing::error!(error = %publish_err, "failed to publish HOOK_ERROR");
                }
                return;
            }
        };

        // Structural changes apply immediately, in declared order; the
        // publishes are collected and appended in one transaction so a
        // concurrent reader sees all of them or none, always after every
        // add_agents in the list has taken effect.
        let mut drafts = Vec::new();
        for operation in operations.operations {
            match operation {
                ClusterOperation::AddAgents { agents } => {
                    for definition in agents {
                        if self.agent(&definition.id).is_some() {
                            tracing::warn!(
                                agent = %definition.id,
                                "skipping add_agents for duplicate id"
                            );
                            continue;
                        }
                        let definition_for_record = {
                            let registered = self.register_agent(definition);
                            registered.definition()
                        };
                        let mut record = self.record.write().expect("record poisoned");
                        record.config.agents.push(definition_for_record);
                    }
                }
                ClusterOperation::RemoveAgent { id } => {
                    self.agents
                        .write()
                        .expect("agents poisoned")
                        .retain(|agent| agent.id() != id);
                    let mut record = self.record.write().expect("record poisoned");
                    record.config.agents.retain(|agent| agent.id != id);
                }
                ClusterOperation::Publish {
                    topic,
                    content,
                    receiver,
                    metadata,
                } => {
                    let mut draft =
                        MessageDraft::new(self.id(), topic, message.sender.clone())
                            .content(content);
                    if let Some(receiver) = receiver {
                        draft = draft.receiver(receiver);
                    }
                    for (key, value) in metadata {
                        draft = draft.meta(key, value);
                    }
                    drafts.push(draft);
                }
                ClusterOperation::Stop { reason } => {
                    self.stop(reason);
                }
            }
        }

        if let Err(err) = self.index.upsert(&self.record()) {
            tracing::warn!(cluster = %self.id(), error = %err, "failed to persist cluster config");
        }
        if !drafts.is_empty() {
            if let Err(err) = self.bus.publish_all(drafts) {
                tracing::error!(cluster = %self.id(), error = %err, "operation publish failed");
            }
        }
    }

    // -----------------------------------------------------------------
    // Startup policy scan
    // -----------------------------------------------------------------

    /// Surface model rules that can never satisfy the configured bounds,
    /// before any task runs.
    pub fn publish_model_policy_errors(&self) {
        let settings = match self.settings.load() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load settings for model rule scan");
                return;
            }
        };
        for agent in self.agents_snapshot() {
            let definition = agent.definition();
            for level in model_rule_violations(&definition, &settings) {
                let draft = MessageDraft::new(self.id(), topics::AGENT_ERROR, definition.id.clone())
                    .content(MessageContent::data(json!({
                        "code": error_codes::MODEL_CEILING_VIOLATION,
                        "model_level": level.as_str(),
                        "detail": "model rule can never satisfy the configured bounds",
                    })));
                if let Err(err) = self.bus.publish(draft) {
                    tracing::error!(error = %err, "failed to publish AGENT_ERROR");
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Task execution
    // -----------------------------------------------------------------

    async fn run_task(
        self: Arc<Self>,
        agent: Arc<AgentRuntime>,
        trigger_message: Message,
        iteration: u32,
        task_id: String,
    ) {
        let definition = agent.definition();
        let agent_id = definition.id.clone();
        let cluster_id = self.id();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.start",
                component: "cluster.agent",
                cluster_id: Some(cluster_id.as_str()),
                agent_id: Some(&agent_id),
                task_id: Some(&task_id),
                topic: Some(&trigger_message.topic),
                status: Some("start"),
                ..ObservabilityEvent::default()
            },
        );

        run_hooks(
            self.as_ref(),
            &agent_id,
            "on_start",
            &definition.hooks.on_start,
            &Value::Null,
        )
        .await;

        // Settings are read through at every spawn; a mid-run settings
        // change applies to the next task, never an in-flight one.
        let settings = match self.settings.load() {
            Ok(settings) => settings,
            Err(err) => {
                self.publish_agent_error(&agent_id, error_codes::RUNNER_FAILURE, &err.to_string());
                agent.abort_task();
                self.drain_deferred(&agent_id);
                return;
            }
        };

        let choice = match select_model(&definition, iteration, &settings) {
            Ok(choice) => choice,
            Err(err) => {
                self.publish_agent_error(&agent_id, err.code(), &err.to_string());
                agent.abort_task();
                self.drain_deferred(&agent_id);
                return;
            }
        };

        // Schema-vs-streaming policy: strict json goes to the runner with
        // the schema in-band; non-strict json streams and validates after.
        let schema = (definition.output_format != OutputFormat::Text)
            .then(|| definition.effective_schema());
        let strict = definition.strict_schema && settings.strict_schema;
        let effective_format = match definition.output_format {
            OutputFormat::Json if !strict && schema.is_some() => OutputFormat::StreamJson,
            other => other,
        };

        let record = self.record();
        let anchors = ContextAnchors {
            cluster_created_at: record.created_at,
            last_task_end: agent.last_task_end(),
        };
        let prompt = match build_prompt(
            &definition,
            iteration,
            anchors,
            &self.ledger,
            effective_format,
            schema.as_ref(),
        ) {
            Ok(prompt) => prompt,
            Err(err @ quorum_ledger::LedgerError::Corrupt { .. }) => {
                // A stored record that no longer parses is never discarded
                // or worked around; the whole cluster aborts.
                tracing::error!(cluster = %cluster_id, error = %err, "ledger corruption");
                self.fail();
                agent.abort_task();
                return;
            }
            Err(err) => {
                self.publish_agent_error(&agent_id, error_codes::RUNNER_FAILURE, &err.to_string());
                agent.abort_task();
                self.drain_deferred(&agent_id);
                return;
            }
        };

        let started = MessageDraft::new(self.id(), topics::TASK_STARTED, agent_id.clone())
            .content(MessageContent::data(json!({
                "iteration": iteration,
                "task_id": task_id,
                "trigger_message_id": trigger_message.id,
            })));
        if let Err(err) = self.bus.publish(started) {
            tracing::error!(error = %err, "failed to publish TASK_STARTED");
        }

        let task_cancel = self.cancel.child_token();
        self.spawn_stale_watchdog(&agent, &definition, &task_id, &task_cancel);

        let options = RunnerOptions {
            agent_id: agent_id.clone(),
            provider: choice.provider.clone(),
            model: Some(choice.model.clone()),
            model_level: Some(choice.model_level),
            reasoning_effort: choice.reasoning_effort.clone(),
            output_format: effective_format,
            json_schema: if strict { schema.clone() } else { None },
            strict_schema: strict,
            cwd: definition.cwd.clone(),
            on_output: None,
            cancel: task_cancel.clone(),
        };

        let outcome = if definition.timeout_ms > 0 {
            match tokio::time::timeout(
                Duration::from_millis(definition.timeout_ms),
                self.runner.run(&prompt, options),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    task_cancel.cancel();
                    let draft =
                        MessageDraft::new(self.id(), topics::AGENT_TIMEOUT, agent_id.clone())
                            .content(MessageContent::data(json!({
                                "task_id": task_id,
                                "timeout_ms": definition.timeout_ms,
                            })));
                    if let Err(err) = self.bus.publish(draft) {
                        tracing::error!(error = %err, "failed to publish AGENT_TIMEOUT");
                    }
                    RunnerOutcome::failed(format!(
                        "task exceeded its {}ms timeout",
                        definition.timeout_ms
                    ))
                }
            }
        } else {
            self.runner.run(&prompt, options).await
        };

        let (success, result) = self.finish_outcome(&definition, &outcome, schema.as_ref());

        let hooks = if success {
            &definition.hooks.on_complete
        } else {
            &definition.hooks.on_error
        };
        let phase = if success { "on_complete" } else { "on_error" };
        run_hooks(self.as_ref(), &agent_id, phase, hooks, &result).await;

        let completed = MessageDraft::new(self.id(), topics::TASK_COMPLETED, agent_id.clone())
            .content(MessageContent::data(json!({
                "iteration": iteration,
                "task_id": task_id,
                "success": success,
            })));
        if let Err(err) = self.bus.publish(completed) {
            tracing::error!(error = %err, "failed to publish TASK_COMPLETED");
        }
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.finish",
                component: "cluster.agent",
                cluster_id: Some(cluster_id.as_str()),
                agent_id: Some(&agent_id),
                task_id: Some(&task_id),
                status: Some(if success { "ok" } else { "failed" }),
                ..ObservabilityEvent::default()
            },
        );

        agent.finish_task();
        self.drain_deferred(&agent_id);
    }

    /// Classify the runner outcome: parse and validate schema-bearing
    /// output, mapping failures to the error taxonomy. Returns the success
    /// flag and the result value hooks interpolate against.
    fn finish_outcome(
        &self,
        definition: &AgentDefinition,
        outcome: &RunnerOutcome,
        schema: Option<&Value>,
    ) -> (bool, Value) {
        let agent_id = &definition.id;
        if !outcome.success {
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "task runner reported failure".to_string());
            self.publish_agent_error(agent_id, error_codes::RUNNER_FAILURE, &error);
            return (false, json!({ "error": error, "output": outcome.output }));
        }

        let Some(schema) = schema else {
            return (true, json!({ "text": outcome.output }));
        };

        let parsed = parse_output(&outcome.output).and_then(|mut value| {
            normalize_enums(&mut value, schema);
            validate(&value, schema).map(|()| value)
        });
        match parsed {
            Ok(value) => (true, value),
            Err(err) => self.schema_failure(definition, &outcome.output, err),
        }
    }

    /// Schema drift is fatal for validators and a warning for everyone
    /// else, whose raw output passes through as text.
    fn schema_failure(
        &self,
        definition: &AgentDefinition,
        raw_output: &str,
        err: SchemaError,
    ) -> (bool, Value) {
        if definition.is_validator() {
            self.publish_agent_error(
                &definition.id,
                error_codes::SCHEMA_VIOLATION,
                &err.to_string(),
            );
            (
                false,
                json!({ "error": err.to_string(), "output": raw_output }),
            )
        } else {
            let draft = MessageDraft::new(
                self.id(),
                topics::AGENT_SCHEMA_WARNING,
                definition.id.clone(),
            )
            .content(MessageContent::data(json!({
                "error": err.to_string(),
            })));
            if let Err(publish_err) = self.bus.publish(draft) {
                tracing::error!(error = %publish_err, "failed to publish AGENT_SCHEMA_WARNING");
            }
            (true, json!({ "text": raw_output }))
        }
    }

    fn publish_agent_error(&self, agent_id: &str, code: &str, detail: &str) {
        let cluster_id = self.id();
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "agent.error",
                component: "cluster.agent",
                cluster_id: Some(cluster_id.as_str()),
                agent_id: Some(agent_id),
                error_code: Some(code),
                detail: Some(detail),
                ..ObservabilityEvent::default()
            },
        );
        let draft = MessageDraft::new(self.id(), topics::AGENT_ERROR, agent_id)
            .content(MessageContent::data(json!({
                "code": code,
                "error": detail,
            })));
        if let Err(err) = self.bus.publish(draft) {
            tracing::error!(error = %err, "failed to publish AGENT_ERROR");
        }
    }

    fn spawn_stale_watchdog(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        definition: &AgentDefinition,
        task_id: &str,
        task_cancel: &CancellationToken,
    ) {
        if definition.stale_duration_ms == 0 {
            return;
        }
        let runtime = Arc::downgrade(self);
        let agent = agent.clone();
        let agent_id = definition.id.clone();
        let task_id = task_id.to_string();
        let stale_after = Duration::from_millis(definition.stale_duration_ms);
        let task_cancel = task_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(stale_after).await;
            if !agent.task_in_flight(&task_id) {
                return;
            }
            let Some(runtime) = runtime.upgrade() else {
                return;
            };
            let draft = MessageDraft::new(runtime.id(), topics::AGENT_STALE, agent_id.clone())
                .content(MessageContent::data(json!({
                    "task_id": task_id,
                    "stale_after_ms": stale_after.as_millis() as u64,
                })));
            if let Err(err) = runtime.bus.publish(draft) {
                tracing::error!(error = %err, "failed to publish AGENT_STALE");
            }
            task_cancel.cancel();
        });
    }

    // -----------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------

    /// Rebuild agent lifecycle state from the ledger's task brackets.
    /// Nothing is replayed: the ledger already reflects the desired state.
    pub fn restore_from_ledger(&self) {
        for agent in self.agents_snapshot() {
            let agent_id = agent.id();
            let iteration = self
                .ledger
                .count(&MessageFilter::topic(topics::TASK_STARTED).sender(agent_id.clone()))
                .unwrap_or(0) as u32;
            let last_task_end = self
                .ledger
                .find_last(&MessageFilter::topic(topics::TASK_COMPLETED).sender(agent_id.clone()))
                .ok()
                .flatten()
                .and_then(|message| Utc.timestamp_millis_opt(message.timestamp).single());
            agent.restore(iteration, last_task_end);
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger logic host
// ---------------------------------------------------------------------------

struct LogicView<'a> {
    runtime: &'a ClusterRuntime,
    message: &'a Message,
}

impl LogicView<'_> {
    fn filter(&self, value: &Value) -> Result<MessageFilter, LogicError> {
        MessageFilter::from_value(value).map_err(LogicError::Host)
    }
}

impl LogicHost for LogicView<'_> {
    fn message(&self) -> Value {
        self.message.to_value()
    }

    fn ledger_query(&self, filter: &Value) -> Result<Value, LogicError> {
        let messages = self
            .runtime
            .ledger
            .query(&self.filter(filter)?)
            .map_err(|err| LogicError::Host(err.to_string()))?;
        Ok(Value::Array(
            messages.iter().map(Message::to_value).collect(),
        ))
    }

    fn ledger_find_last(&self, filter: &Value) -> Result<Value, LogicError> {
        let found = self
            .runtime
            .ledger
            .find_last(&self.filter(filter)?)
            .map_err(|err| LogicError::Host(err.to_string()))?;
        Ok(found.map(|m| m.to_value()).unwrap_or(Value::Null))
    }

    fn ledger_count(&self, filter: &Value) -> Result<Value, LogicError> {
        let count = self
            .runtime
            .ledger
            .count(&self.filter(filter)?)
            .map_err(|err| LogicError::Host(err.to_string()))?;
        Ok(json!(count))
    }

    fn cluster_agents(&self) -> Result<Value, LogicError> {
        let agents: Vec<Value> = self
            .runtime
            .agents_snapshot()
            .iter()
            .map(|agent| {
                let status = agent.status();
                json!({
                    "id": status.id,
                    "role": status.role,
                    "state": status.state,
                    "iteration": status.iteration,
                })
            })
            .collect();
        Ok(Value::Array(agents))
    }

    fn all_responded(
        &self,
        agents: &Value,
        topic: &Value,
        since: &Value,
    ) -> Result<bool, LogicError> {
        let Some(topic) = topic.as_str() else {
            return Err(LogicError::Host("allResponded topic must be a string".to_string()));
        };
        let Some(agents) = agents.as_array() else {
            return Err(LogicError::Host("allResponded agents must be an array".to_string()));
        };
        let since_ms = match since {
            Value::Null => None,
            Value::Number(n) => n.as_i64(),
            Value::String(raw) => chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|ts| ts.timestamp_millis()),
            _ => None,
        };
        for entry in agents {
            let id = entry
                .as_str()
                .or_else(|| entry.get("id").and_then(Value::as_str))
                .ok_or_else(|| {
                    LogicError::Host("allResponded agents must be ids or have an id".to_string())
                })?;
            let mut filter = MessageFilter::topic(topic).sender(id);
            if let Some(since_ms) = since_ms {
                filter = filter.since(since_ms);
            }
            let responded = self
                .runtime
                .ledger
                .count(&filter)
                .map_err(|err| LogicError::Host(err.to_string()))?;
            if responded == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Hook host
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl HookHost for ClusterRuntime {
    fn cluster_id(&self) -> String {
        self.id()
    }

    fn publish(&self, draft: MessageDraft) -> Result<Message, HookError> {
        self.bus
            .publish(draft)
            .map_err(|err| HookError::Publish(err.to_string()))
    }

    fn stop_cluster(&self, reason: Option<String>) {
        self.stop(reason);
    }

    fn ledger_last(&self, topic: &str) -> Result<Option<Message>, HookError> {
        self.ledger
            .find_last(&MessageFilter::topic(topic))
            .map_err(|err| HookError::Publish(err.to_string()))
    }

    async fn spawn_sub_cluster(
        &self,
        config: &Value,
        input: &str,
        wait_for_topic: Option<&str>,
    ) -> Result<Value, HookError> {
        let orchestrator = self
            .orchestrator
            .lock()
            .expect("orchestrator weak poisoned")
            .upgrade()
            .ok_or_else(|| HookError::Spawn("orchestrator is gone".to_string()))?;
        let child = orchestrator
            .start_from_value(config.clone(), crate::input::TaskInput::Text(input.to_string()))
            .await
            .map_err(|err| HookError::Spawn(err.to_string()))?;

        let Some(topic) = wait_for_topic else {
            return Ok(json!({ "cluster_id": child.id() }));
        };

        loop {
            if self.cancel.is_cancelled() {
                return Ok(json!({ "cluster_id": child.id(), "observed": false }));
            }
            let observed = child
                .ledger()
                .find_last(&MessageFilter::topic(topic))
                .map_err(|err| HookError::Spawn(err.to_string()))?;
            if observed.is_some() {
                return Ok(json!({ "cluster_id": child.id(), "observed": true }));
            }
            if child.state().is_terminal() {
                return Ok(json!({ "cluster_id": child.id(), "observed": false }));
            }
            tokio::time::sleep(SUB_CLUSTER_POLL).await;
        }
    }
}
