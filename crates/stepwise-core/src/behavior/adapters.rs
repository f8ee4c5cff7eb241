//! Closure adapters for synchronous behaviors.
//!
//! Most deterministic behaviors are a plain function of the context. These
//! wrappers lift `Fn(&mut WorkflowContext) -> Result<_, BehaviorError>`
//! closures into the async behavior traits.

use stepwise_types::instance::WorkflowContext;
use stepwise_types::workflow::StepOutput;

use super::traits::{BehaviorError, BranchBehavior, LoopPredicate, StepBehavior, StepCall};

/// Step behavior backed by a closure.
pub struct FnStep<F>(F);

/// Branch behavior backed by a closure.
pub struct FnBranch<F>(F);

/// Loop predicate backed by a closure.
pub struct FnPredicate<F>(F);

pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(&mut WorkflowContext) -> Result<StepOutput, BehaviorError> + Send + Sync,
{
    FnStep(f)
}

pub fn branch_fn<F>(f: F) -> FnBranch<F>
where
    F: Fn(&mut WorkflowContext) -> Result<String, BehaviorError> + Send + Sync,
{
    FnBranch(f)
}

pub fn predicate_fn<F>(f: F) -> FnPredicate<F>
where
    F: Fn(&mut WorkflowContext) -> Result<bool, BehaviorError> + Send + Sync,
{
    FnPredicate(f)
}

impl<F> StepBehavior for FnStep<F>
where
    F: Fn(&mut WorkflowContext) -> Result<StepOutput, BehaviorError> + Send + Sync,
{
    async fn execute(&self, call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
        (self.0)(call.context)
    }
}

impl<F> BranchBehavior for FnBranch<F>
where
    F: Fn(&mut WorkflowContext) -> Result<String, BehaviorError> + Send + Sync,
{
    async fn branch(&self, call: StepCall<'_>) -> Result<String, BehaviorError> {
        (self.0)(call.context)
    }
}

impl<F> LoopPredicate for FnPredicate<F>
where
    F: Fn(&mut WorkflowContext) -> Result<bool, BehaviorError> + Send + Sync,
{
    async fn should_continue(&self, call: StepCall<'_>) -> Result<bool, BehaviorError> {
        (self.0)(call.context)
    }
}
