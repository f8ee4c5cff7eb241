//! Boxed behaviors -- object-safe dynamic dispatch wrappers.
//!
//! Same blanket-impl pattern for each of the three behavior traits:
//! an object-safe `*Dyn` trait with boxed futures, a blanket impl for every
//! implementor of the RPITIT trait, and a `Box*` newtype that delegates.

use std::future::Future;
use std::pin::Pin;

use stepwise_types::workflow::StepOutput;

use super::traits::{BehaviorError, BranchBehavior, LoopPredicate, StepBehavior, StepCall};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BehaviorError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// StepBehavior
// ---------------------------------------------------------------------------

/// Object-safe version of [`StepBehavior`] with boxed futures.
pub trait StepBehaviorDyn: Send + Sync {
    fn execute_boxed<'a>(&'a self, call: StepCall<'a>) -> BoxFuture<'a, StepOutput>;
}

impl<T: StepBehavior> StepBehaviorDyn for T {
    fn execute_boxed<'a>(&'a self, call: StepCall<'a>) -> BoxFuture<'a, StepOutput> {
        Box::pin(self.execute(call))
    }
}

/// Type-erased step behavior, as stored in the `BehaviorRegistry`.
pub struct BoxStepBehavior {
    inner: Box<dyn StepBehaviorDyn + Send + Sync>,
}

impl BoxStepBehavior {
    pub fn new<T: StepBehavior + 'static>(behavior: T) -> Self {
        Self {
            inner: Box::new(behavior),
        }
    }

    pub async fn execute(&self, call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
        self.inner.execute_boxed(call).await
    }
}

// ---------------------------------------------------------------------------
// BranchBehavior
// ---------------------------------------------------------------------------

/// Object-safe version of [`BranchBehavior`] with boxed futures.
pub trait BranchBehaviorDyn: Send + Sync {
    fn branch_boxed<'a>(&'a self, call: StepCall<'a>) -> BoxFuture<'a, String>;
}

impl<T: BranchBehavior> BranchBehaviorDyn for T {
    fn branch_boxed<'a>(&'a self, call: StepCall<'a>) -> BoxFuture<'a, String> {
        Box::pin(self.branch(call))
    }
}

/// Type-erased branch behavior.
pub struct BoxBranchBehavior {
    inner: Box<dyn BranchBehaviorDyn + Send + Sync>,
}

impl BoxBranchBehavior {
    pub fn new<T: BranchBehavior + 'static>(behavior: T) -> Self {
        Self {
            inner: Box::new(behavior),
        }
    }

    pub async fn branch(&self, call: StepCall<'_>) -> Result<String, BehaviorError> {
        self.inner.branch_boxed(call).await
    }
}

// ---------------------------------------------------------------------------
// LoopPredicate
// ---------------------------------------------------------------------------

/// Object-safe version of [`LoopPredicate`] with boxed futures.
pub trait LoopPredicateDyn: Send + Sync {
    fn should_continue_boxed<'a>(&'a self, call: StepCall<'a>) -> BoxFuture<'a, bool>;
}

impl<T: LoopPredicate> LoopPredicateDyn for T {
    fn should_continue_boxed<'a>(&'a self, call: StepCall<'a>) -> BoxFuture<'a, bool> {
        Box::pin(self.should_continue(call))
    }
}

/// Type-erased loop predicate.
pub struct BoxLoopPredicate {
    inner: Box<dyn LoopPredicateDyn + Send + Sync>,
}

impl BoxLoopPredicate {
    pub fn new<T: LoopPredicate + 'static>(predicate: T) -> Self {
        Self {
            inner: Box::new(predicate),
        }
    }

    pub async fn should_continue(&self, call: StepCall<'_>) -> Result<bool, BehaviorError> {
        self.inner.should_continue_boxed(call).await
    }
}
