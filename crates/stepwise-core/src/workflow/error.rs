use stepwise_types::error::RepositoryError;
use stepwise_types::instance::WorkflowStatus;
use stepwise_types::workflow::CheckpointAction;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the definition registry and the workflow engine.
///
/// Structural and behavior failures met while advancing are recorded on the
/// instance (status `failed`) rather than returned; the variants double as the
/// recorded message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow definition '{0}' is already registered")]
    DuplicateDefinition(String),

    #[error("workflow definition '{0}' not found")]
    DefinitionNotFound(String),

    #[error("invalid workflow definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("unknown step '{reference}' ({origin})")]
    UnknownStepReference { reference: String, origin: String },

    #[error("step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("no behavior bound to '{0}'")]
    BehaviorNotFound(String),

    #[error("action '{action}' is not allowed at checkpoint '{step_id}'")]
    InvalidCheckpointAction {
        step_id: String,
        action: CheckpointAction,
    },

    #[error("field '{field}' is not editable at checkpoint '{step_id}'")]
    InvalidEditableField { step_id: String, field: String },

    #[error("workflow instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("cannot {operation} instance {instance_id} while {status}")]
    InvalidStateTransition {
        instance_id: Uuid,
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}
