use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use quorum_types::{
    error_codes, AgentDefinition, AgentState, AgentStatus, ModelConfig, ModelLevel, Settings,
};

/// The resolved model for one task spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub provider: String,
    pub model: String,
    pub model_level: ModelLevel,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelPolicyError {
    #[error("no model rule matches iteration {0}")]
    NoModelRule(u32),

    #[error("model level {selected} lies outside the configured bounds")]
    CeilingViolation { selected: ModelLevel },
}

impl ModelPolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            ModelPolicyError::NoModelRule(_) => error_codes::NO_MODEL_RULE,
            ModelPolicyError::CeilingViolation { .. } => error_codes::MODEL_CEILING_VIOLATION,
        }
    }
}

/// Pick the model for an iteration: static config as-is, rule lists by
/// first matching pattern. A rule gap is a hard error, and the selection
/// must lie within the settings' floor/ceiling.
pub fn select_model(
    definition: &AgentDefinition,
    iteration: u32,
    settings: &Settings,
) -> Result<ModelChoice, ModelPolicyError> {
    let (model, model_level, reasoning_effort) = match &definition.model_config {
        ModelConfig::Static { model, model_level } => (model.clone(), *model_level, None),
        ModelConfig::Rules { rules } => {
            let rule = rules
                .iter()
                .find(|rule| rule.iterations.matches(iteration))
                .ok_or(ModelPolicyError::NoModelRule(iteration))?;
            (rule.model.clone(), rule.model_level, rule.reasoning_effort.clone())
        }
    };

    let provider = settings.provider(&settings.default_provider);
    let level = model_level
        .or_else(|| model.as_deref().and_then(ModelLevel::parse))
        .unwrap_or(provider.default_level);
    if !settings.level_in_bounds(level) {
        return Err(ModelPolicyError::CeilingViolation { selected: level });
    }

    Ok(ModelChoice {
        provider: settings.default_provider.clone(),
        model: model.unwrap_or_else(|| provider.model_for(level)),
        model_level: level,
        reasoning_effort,
    })
}

/// Model-rule levels that can never satisfy the configured bounds. Checked
/// eagerly at cluster start so a misconfigured escalation ladder surfaces
/// before any task runs.
pub fn model_rule_violations(definition: &AgentDefinition, settings: &Settings) -> Vec<ModelLevel> {
    let ModelConfig::Rules { rules } = &definition.model_config else {
        return Vec::new();
    };
    rules
        .iter()
        .filter_map(|rule| {
            rule.model_level
                .or_else(|| rule.model.as_deref().and_then(ModelLevel::parse))
        })
        .filter(|level| !settings.level_in_bounds(*level))
        .collect()
}

#[derive(Debug)]
struct AgentStateInner {
    state: AgentState,
    iteration: u32,
    last_task_end: Option<DateTime<Utc>>,
    in_flight_task_id: Option<String>,
    halted: bool,
}

/// Outcome of asking an agent to start a task.
#[derive(Debug, PartialEq)]
pub enum TaskBegin {
    Begun { iteration: u32, task_id: String },
    /// A task is already in flight; the trigger is deferred.
    Busy,
    /// The iteration ceiling was hit. `first_time` is true exactly once so
    /// the caller publishes a single `AGENT_HALTED`.
    Halted { first_time: bool },
}

/// One agent's runtime half: the definition plus the mutable lifecycle
/// state. At most one task is in flight at any moment; `iteration` is
/// incremented before each spawn and never decreases.
pub struct AgentRuntime {
    definition: RwLock<AgentDefinition>,
    state: Mutex<AgentStateInner>,
}

impl AgentRuntime {
    pub fn new(definition: AgentDefinition) -> Self {
        Self {
            definition: RwLock::new(definition),
            state: Mutex::new(AgentStateInner {
                state: AgentState::Idle,
                iteration: 0,
                last_task_end: None,
                in_flight_task_id: None,
                halted: false,
            }),
        }
    }

    pub fn id(&self) -> String {
        self.definition.read().expect("definition poisoned").id.clone()
    }

    pub fn definition(&self) -> AgentDefinition {
        self.definition.read().expect("definition poisoned").clone()
    }

    /// Fill in an inherited working directory when the definition has none.
    pub fn inherit_cwd(&self, cwd: &str) {
        let mut def = self.definition.write().expect("definition poisoned");
        if def.cwd.is_none() {
            def.cwd = Some(cwd.to_string());
        }
    }

    /// Restore lifecycle counters from ledger history on resume.
    pub fn restore(&self, iteration: u32, last_task_end: Option<DateTime<Utc>>) {
        let mut inner = self.state.lock().expect("agent state poisoned");
        inner.iteration = iteration;
        inner.last_task_end = last_task_end;
    }

    /// idle -> executing, reserving the next iteration.
    pub fn try_begin(&self) -> TaskBegin {
        let max_iterations = self
            .definition
            .read()
            .expect("definition poisoned")
            .max_iterations;
        let mut inner = self.state.lock().expect("agent state poisoned");
        if inner.halted {
            return TaskBegin::Halted { first_time: false };
        }
        if inner.iteration >= max_iterations {
            inner.halted = true;
            return TaskBegin::Halted { first_time: true };
        }
        if inner.state != AgentState::Idle {
            return TaskBegin::Busy;
        }
        inner.state = AgentState::Executing;
        inner.iteration += 1;
        let task_id = Uuid::new_v4().to_string();
        inner.in_flight_task_id = Some(task_id.clone());
        TaskBegin::Begun {
            iteration: inner.iteration,
            task_id,
        }
    }

    /// executing -> idle. Records the task end time used by
    /// `since: last_task_end` context scoping.
    pub fn finish_task(&self) {
        let mut inner = self.state.lock().expect("agent state poisoned");
        inner.state = AgentState::Idle;
        inner.in_flight_task_id = None;
        inner.last_task_end = Some(Utc::now());
    }

    /// Release the slot without recording a task end (model policy failures
    /// never ran anything).
    pub fn abort_task(&self) {
        let mut inner = self.state.lock().expect("agent state poisoned");
        inner.state = AgentState::Idle;
        inner.in_flight_task_id = None;
    }

    pub fn iteration(&self) -> u32 {
        self.state.lock().expect("agent state poisoned").iteration
    }

    pub fn last_task_end(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("agent state poisoned").last_task_end
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().expect("agent state poisoned").state == AgentState::Idle
    }

    /// Whether the given task is still the one in flight. The stale
    /// watchdog uses this to avoid flagging a completed task.
    pub fn task_in_flight(&self, task_id: &str) -> bool {
        self.state
            .lock()
            .expect("agent state poisoned")
            .in_flight_task_id
            .as_deref()
            == Some(task_id)
    }

    pub fn status(&self) -> AgentStatus {
        let def = self.definition.read().expect("definition poisoned");
        let inner = self.state.lock().expect("agent state poisoned");
        AgentStatus {
            id: def.id.clone(),
            role: def.role.clone(),
            state: inner.state,
            iteration: inner.iteration,
            last_task_end_time: inner.last_task_end,
            in_flight_task_id: inner.in_flight_task_id.clone(),
        }
    }
}
