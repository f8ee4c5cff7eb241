//! Workflow definition types for Stepwise.
//!
//! A `WorkflowDefinition` is an immutable template: an ordered list of steps,
//! the id of the first one, and opaque input/output shape descriptors. Steps
//! reference their successors by id and reference their behaviors by string
//! identifier, so a definition is plain data that can round-trip through JSON
//! or YAML and be compared structurally.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Registry key (e.g. "literature-review").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Grouping used by `list_by_category` (e.g. "research", "content").
    pub category: String,
    /// Icon identifier for UI listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Ordered list of steps.
    pub steps: Vec<StepDefinition>,
    /// Id of the step an instance starts at.
    pub initial_step_id: String,
    /// Shape of the initial input (opaque to the engine).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub input_schema: serde_json::Value,
    /// Shape of the final output (opaque to the engine).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output_schema: serde_json::Value,
    /// How the final output is derived when an instance completes.
    #[serde(default)]
    pub final_output: FinalOutputPolicy,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn get_step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Whether `step_id` names a step in this definition.
    pub fn has_step(&self, step_id: &str) -> bool {
        self.get_step(step_id).is_some()
    }

    /// All step ids, in declaration order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Every `(step_id, referenced_id)` edge declared statically by the steps.
    ///
    /// Conditional targets are computed at runtime and are not included.
    pub fn static_references(&self) -> Vec<(&str, &str)> {
        let mut refs = Vec::new();
        for step in &self.steps {
            for target in step.config.static_targets() {
                refs.push((step.id.as_str(), target));
            }
        }
        refs
    }

    /// Behavior identifiers this definition needs bound at runtime, deduplicated.
    pub fn behavior_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .filter_map(|s| s.config.behavior_id())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// How an instance's final output is computed on completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinalOutputPolicy {
    /// Output data of the last execute step that ran.
    #[default]
    LastStep,
    /// Output data recorded for a specific step.
    Step { step_id: String },
    /// An object of every step's recorded output, keyed by step id.
    AllSteps,
    /// No final output; the caller aggregates from the context.
    None,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single node in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within its definition (e.g. "collect").
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Which UI component a client should render for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_component: Option<String>,
    /// Type-specific configuration.
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// The kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Execute,
    Checkpoint,
    Conditional,
    Loop,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::Execute => "execute",
            StepType::Checkpoint => "checkpoint",
            StepType::Conditional => "conditional",
            StepType::Loop => "loop",
        };
        f.write_str(s)
    }
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: execute
///   behavior: research.collect
///   next_step_id: review
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke a step behavior and record its output.
    Execute {
        behavior: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step_id: Option<String>,
    },
    /// Suspend for a human decision.
    Checkpoint {
        #[serde(flatten)]
        checkpoint: CheckpointConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step_id: Option<String>,
        /// Where `reject` goes. Absent means reject cancels the instance.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reject_step_id: Option<String>,
    },
    /// Ask a branch behavior for the next step id.
    Conditional { behavior: String },
    /// Jump back to `loop_step_id` while the predicate holds.
    Loop {
        predicate: String,
        loop_step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Execute { .. } => StepType::Execute,
            StepConfig::Checkpoint { .. } => StepType::Checkpoint,
            StepConfig::Conditional { .. } => StepType::Conditional,
            StepConfig::Loop { .. } => StepType::Loop,
        }
    }

    /// The default successor, if this step type has one.
    pub fn next_step_id(&self) -> Option<&str> {
        match self {
            StepConfig::Execute { next_step_id, .. }
            | StepConfig::Checkpoint { next_step_id, .. }
            | StepConfig::Loop { next_step_id, .. } => next_step_id.as_deref(),
            StepConfig::Conditional { .. } => None,
        }
    }

    /// Behavior identifier bound to this step, if any.
    pub fn behavior_id(&self) -> Option<&str> {
        match self {
            StepConfig::Execute { behavior, .. } | StepConfig::Conditional { behavior } => {
                Some(behavior)
            }
            StepConfig::Loop { predicate, .. } => Some(predicate),
            StepConfig::Checkpoint { .. } => None,
        }
    }

    /// Step ids referenced by this config that are known before execution.
    pub fn static_targets(&self) -> Vec<&str> {
        match self {
            StepConfig::Execute { next_step_id, .. } => next_step_id.iter().map(String::as_str).collect(),
            StepConfig::Checkpoint {
                next_step_id,
                reject_step_id,
                ..
            } => next_step_id
                .iter()
                .chain(reject_step_id.iter())
                .map(String::as_str)
                .collect(),
            StepConfig::Conditional { .. } => Vec::new(),
            StepConfig::Loop {
                loop_step_id,
                next_step_id,
                ..
            } => std::iter::once(loop_step_id.as_str())
                .chain(next_step_id.as_deref())
                .collect(),
        }
    }

    /// The checkpoint configuration, for checkpoint steps.
    pub fn checkpoint(&self) -> Option<&CheckpointConfig> {
        match self {
            StepConfig::Checkpoint { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Actions a human can take at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointAction {
    /// Accept and continue.
    Approve,
    /// Override editable fields, then continue.
    Edit,
    /// Abort, or go to the step's rejection target.
    Reject,
    /// Skip this checkpoint.
    Skip,
}

impl std::fmt::Display for CheckpointAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointAction::Approve => "approve",
            CheckpointAction::Edit => "edit",
            CheckpointAction::Reject => "reject",
            CheckpointAction::Skip => "skip",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CheckpointAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" => Ok(CheckpointAction::Approve),
            "edit" => Ok(CheckpointAction::Edit),
            "reject" => Ok(CheckpointAction::Reject),
            "skip" => Ok(CheckpointAction::Skip),
            other => Err(format!("unknown checkpoint action '{other}'")),
        }
    }
}

/// What a checkpoint shows and which decisions it accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_allowed_actions")]
    pub allowed_actions: Vec<CheckpointAction>,
    /// Field names an `edit` decision may override.
    #[serde(default)]
    pub editable_fields: Vec<String>,
    /// Treat a missing decision as `approve` once the timeout elapses.
    #[serde(default)]
    pub auto_proceed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_proceed_timeout_secs: Option<u64>,
}

fn default_allowed_actions() -> Vec<CheckpointAction> {
    vec![
        CheckpointAction::Approve,
        CheckpointAction::Edit,
        CheckpointAction::Reject,
    ]
}

impl CheckpointConfig {
    pub fn allows(&self, action: CheckpointAction) -> bool {
        self.allowed_actions.contains(&action)
    }

    pub fn is_editable(&self, field: &str) -> bool {
        self.editable_fields.iter().any(|f| f == field)
    }
}

// ---------------------------------------------------------------------------
// Step Output
// ---------------------------------------------------------------------------

/// Result of one execution of an execute step.
///
/// Display hints are pass-through for UI clients; the engine never reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_content: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
}

impl StepOutput {
    /// A successful output carrying `data`.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            display_title: None,
            display_content: None,
            content_type: ContentType::default(),
        }
    }

    /// A failed output carrying an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            display_title: None,
            display_content: None,
            content_type: ContentType::default(),
        }
    }

    /// Attach UI display hints.
    pub fn with_display(
        mut self,
        title: impl Into<String>,
        content: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        self.display_title = Some(title.into());
        self.display_content = Some(content.into());
        self.content_type = content_type;
        self
    }
}

/// How `display_content` should be rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    #[default]
    Markdown,
    Json,
    Table,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
