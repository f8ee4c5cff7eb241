//! Step behavior abstractions for Stepwise.
//!
//! The engine knows behaviors only by string identifier. This module defines
//! the capabilities bound to those identifiers and the registry that resolves
//! them:
//! - `StepBehavior`, `BranchBehavior`, `LoopPredicate`: RPITIT traits for
//!   concrete implementations
//! - `BoxStepBehavior` & co.: object-safe wrappers for dynamic dispatch
//! - `BehaviorRegistry`: id-indexed lookup, rebuilt at process start
//! - `step_fn`, `branch_fn`, `predicate_fn`: closure adapters

pub mod adapters;
pub mod box_behavior;
pub mod registry;
pub mod traits;

pub use adapters::{branch_fn, predicate_fn, step_fn};
pub use box_behavior::{BoxBranchBehavior, BoxLoopPredicate, BoxStepBehavior};
pub use registry::BehaviorRegistry;
pub use traits::{BehaviorError, BranchBehavior, LoopPredicate, ProgressSender, StepBehavior, StepCall};
