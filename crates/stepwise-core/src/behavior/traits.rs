//! Behavior trait definitions.
//!
//! These are the capabilities a definition binds to by identifier. All three
//! use native async fn in traits (RPITIT, Rust 2024 edition); the boxed
//! wrappers in `box_behavior` make them usable behind dynamic dispatch.
//!
//! Behaviors receive a `StepCall`: mutable access to the instance context,
//! the definition and step being executed, the instance's cancellation token,
//! and a bounded progress channel whose messages become `StepProgress` events.

use stepwise_types::instance::WorkflowContext;
use stepwise_types::workflow::{StepDefinition, StepOutput, WorkflowDefinition};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors a behavior may return instead of an output.
#[derive(Debug, Error)]
pub enum BehaviorError {
    /// The behavior could not do its job. Fails the step.
    #[error("{0}")]
    Failed(String),

    /// The behavior observed the cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl BehaviorError {
    pub fn failed(message: impl Into<String>) -> Self {
        BehaviorError::Failed(message.into())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Sending half of a step's bounded progress channel.
///
/// Reporting never blocks: when the buffer is full the message is dropped.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<String>>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sender that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Report a progress message. Returns `false` if it was dropped.
    pub fn report(&self, message: impl Into<String>) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(message.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("progress buffer full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// StepCall
// ---------------------------------------------------------------------------

/// Everything a behavior gets for one invocation.
pub struct StepCall<'a> {
    pub definition: &'a WorkflowDefinition,
    pub step: &'a StepDefinition,
    pub context: &'a mut WorkflowContext,
    pub cancel: CancellationToken,
    pub progress: ProgressSender,
}

impl StepCall<'_> {
    pub fn step_id(&self) -> &str {
        &self.step.id
    }

    /// Shorthand for `context.initial_input`.
    pub fn input(&self) -> &serde_json::Value {
        &self.context.initial_input
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress on the step's channel.
    pub fn report(&self, message: impl Into<String>) -> bool {
        self.progress.report(message)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Behavior bound to an `execute` step.
///
/// `StepOutput { success: false, .. }` and `Err` both fail the step.
pub trait StepBehavior: Send + Sync {
    fn execute(
        &self,
        call: StepCall<'_>,
    ) -> impl std::future::Future<Output = Result<StepOutput, BehaviorError>> + Send;
}

/// Behavior bound to a `conditional` step. Returns the id of the next step.
pub trait BranchBehavior: Send + Sync {
    fn branch(
        &self,
        call: StepCall<'_>,
    ) -> impl std::future::Future<Output = Result<String, BehaviorError>> + Send;
}

/// Predicate bound to a `loop` step. `true` sends control back to the loop body.
pub trait LoopPredicate: Send + Sync {
    fn should_continue(
        &self,
        call: StepCall<'_>,
    ) -> impl std::future::Future<Output = Result<bool, BehaviorError>> + Send;
}
