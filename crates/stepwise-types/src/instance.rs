//! Runtime state of a workflow execution.
//!
//! A `WorkflowInstance` is the persisted unit: overall status, the id of the
//! step pending execution, and the `WorkflowContext` that accumulates step
//! outputs, per-step states, checkpoint edits, and typed variables.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{StepOutput, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, never advanced.
    Pending,
    /// Executing steps (or interrupted mid-advance).
    Running,
    /// Stopped at a checkpoint, awaiting a human decision.
    Waiting,
    /// Explicitly paused by a caller.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// `completed`, `failed`, and `cancelled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Statuses from which `advance` may run.
    pub fn is_advanceable(self) -> bool {
        matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Waiting => "waiting",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "waiting" => Ok(WorkflowStatus::Waiting),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

/// Status of a single step within an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

// ---------------------------------------------------------------------------
// Step State
// ---------------------------------------------------------------------------

/// Runtime state of one step in one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last output produced (execute steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times a loop step has sent control back to its body.
    #[serde(default)]
    pub execution_count: u32,
}

impl StepState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            execution_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Context variables
// ---------------------------------------------------------------------------

/// A typed value in the context's variable bag.
///
/// Covers the step-to-step signals behaviors actually exchange (loop counters,
/// flags, short notes); anything richer goes through `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    Flag(bool),
    Counter(i64),
    Text(String),
    Json(serde_json::Value),
}

impl ContextValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            ContextValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<i64> {
        match self {
            ContextValue::Counter(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable runtime state owned by exactly one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub instance_id: Uuid,
    pub definition_id: String,
    /// Input supplied when the instance was created.
    pub initial_input: serde_json::Value,
    /// Output data keyed by step id. Loop iterations overwrite.
    #[serde(default)]
    pub step_data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub step_states: HashMap<String, StepState>,
    /// Field overrides merged from checkpoint `edit` decisions.
    #[serde(default)]
    pub user_edits: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, ContextValue>,
    /// Step ids in the order they started, loop revisits included.
    #[serde(default)]
    pub step_history: Vec<String>,
}

impl WorkflowContext {
    pub fn new(instance_id: Uuid, definition_id: String, initial_input: serde_json::Value) -> Self {
        Self {
            instance_id,
            definition_id,
            initial_input,
            step_data: HashMap::new(),
            step_states: HashMap::new(),
            user_edits: HashMap::new(),
            variables: HashMap::new(),
            step_history: Vec::new(),
        }
    }

    /// Output data recorded by a previous step.
    pub fn get_step_output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.step_data.get(step_id)
    }

    /// A field of the initial input, if the input is an object.
    pub fn input_field(&self, field: &str) -> Option<&serde_json::Value> {
        self.initial_input.get(field)
    }

    /// A checkpoint edit, if one was made for `field`.
    pub fn get_user_edit(&self, field: &str) -> Option<&serde_json::Value> {
        self.user_edits.get(field)
    }

    /// The edited value for `field` if a human overrode it, else the input value.
    pub fn edited_or_input(&self, field: &str) -> Option<&serde_json::Value> {
        self.get_user_edit(field).or_else(|| self.input_field(field))
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: ContextValue) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&ContextValue> {
        self.variables.get(name)
    }

    /// Increment a counter variable (starting from 0) and return the new value.
    ///
    /// A non-counter value under the same name is replaced.
    pub fn increment_counter(&mut self, name: &str) -> i64 {
        let next = self.counter(name) + 1;
        self.variables
            .insert(name.to_string(), ContextValue::Counter(next));
        next
    }

    /// Current value of a counter variable, 0 if unset.
    pub fn counter(&self, name: &str) -> i64 {
        self.get_variable(name)
            .and_then(ContextValue::as_counter)
            .unwrap_or(0)
    }

    /// Current value of a flag variable, false if unset.
    pub fn flag(&self, name: &str) -> bool {
        self.get_variable(name)
            .and_then(ContextValue::as_flag)
            .unwrap_or(false)
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// The state for `step_id`, created as `pending` on first access.
    pub fn step_state_mut(&mut self, step_id: &str) -> &mut StepState {
        self.step_states
            .entry(step_id.to_string())
            .or_insert_with(|| StepState::new(step_id))
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One stateful, persisted execution of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub context: WorkflowContext,
    /// Step pending execution; the checkpoint step while `waiting`; none once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Links the instance to an outside conversation or session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<serde_json::Value>,
    /// Human-readable reason for a `failed` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When an auto-proceed checkpoint approves itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_deadline: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a `pending` instance positioned at the definition's initial step.
    pub fn create(
        definition: &WorkflowDefinition,
        initial_input: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Self {
        let id = Uuid::now_v7();
        let now = Utc::now();
        Self {
            id,
            definition_id: definition.id.clone(),
            status: WorkflowStatus::Pending,
            context: WorkflowContext::new(id, definition.id.clone(), initial_input),
            current_step_id: Some(definition.initial_step_id.clone()),
            created_at: now,
            updated_at: now,
            completed_at: None,
            correlation_id,
            final_output: None,
            error: None,
            checkpoint_deadline: None,
        }
    }

    /// Bump `updated_at`, and stamp `completed_at` when terminal.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
