//! Event types for the Stepwise engine event bus.
//!
//! `EngineEvent` is broadcast by the engine at every lifecycle transition.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels,
//! and every variant carries the `instance_id` it belongs to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{CheckpointAction, CheckpointConfig, StepOutput, StepType};

/// Lifecycle events emitted while an instance executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A step has been marked running.
    StepStarted {
        instance_id: Uuid,
        step_id: String,
        step_name: String,
        step_type: StepType,
    },

    /// An execute step finished successfully.
    StepCompleted {
        instance_id: Uuid,
        step_id: String,
        output: StepOutput,
        duration_ms: u64,
    },

    /// A step failed; the instance fails with it.
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        error: String,
    },

    /// Free-form progress reported by a running behavior.
    StepProgress {
        instance_id: Uuid,
        step_id: String,
        message: String,
    },

    /// The instance is waiting at a checkpoint.
    CheckpointReached {
        instance_id: Uuid,
        step_id: String,
        config: CheckpointConfig,
    },

    /// A checkpoint decision was accepted.
    CheckpointResolved {
        instance_id: Uuid,
        step_id: String,
        action: CheckpointAction,
    },

    WorkflowCompleted {
        instance_id: Uuid,
        final_output: Option<serde_json::Value>,
    },

    WorkflowFailed { instance_id: Uuid, error: String },

    WorkflowCancelled { instance_id: Uuid },

    WorkflowPaused { instance_id: Uuid },
}

impl EngineEvent {
    /// The instance this event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::StepStarted { instance_id, .. }
            | EngineEvent::StepCompleted { instance_id, .. }
            | EngineEvent::StepFailed { instance_id, .. }
            | EngineEvent::StepProgress { instance_id, .. }
            | EngineEvent::CheckpointReached { instance_id, .. }
            | EngineEvent::CheckpointResolved { instance_id, .. }
            | EngineEvent::WorkflowCompleted { instance_id, .. }
            | EngineEvent::WorkflowFailed { instance_id, .. }
            | EngineEvent::WorkflowCancelled { instance_id }
            | EngineEvent::WorkflowPaused { instance_id } => *instance_id,
        }
    }

    /// Snake-case variant name, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::StepProgress { .. } => "step_progress",
            EngineEvent::CheckpointReached { .. } => "checkpoint_reached",
            EngineEvent::CheckpointResolved { .. } => "checkpoint_resolved",
            EngineEvent::WorkflowCompleted { .. } => "workflow_completed",
            EngineEvent::WorkflowFailed { .. } => "workflow_failed",
            EngineEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            EngineEvent::WorkflowPaused { .. } => "workflow_paused",
        }
    }

    /// Whether this event ends the instance's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::WorkflowCompleted { .. }
                | EngineEvent::WorkflowFailed { .. }
                | EngineEvent::WorkflowCancelled { .. }
        )
    }
}
