//! Behavior registry for runtime lookup by identifier.
//!
//! Not persisted: the embedding application registers its behaviors at
//! process start, then shares the registry read-only with the engine.

use std::collections::HashMap;

use stepwise_types::workflow::{StepConfig, WorkflowDefinition};

use super::box_behavior::{BoxBranchBehavior, BoxLoopPredicate, BoxStepBehavior};
use super::traits::{BranchBehavior, LoopPredicate, StepBehavior};

/// Registry of step behaviors, branch behaviors, and loop predicates.
///
/// The three kinds live in separate namespaces; a definition's step type
/// decides which one an identifier is resolved in.
#[derive(Default)]
pub struct BehaviorRegistry {
    steps: HashMap<String, BoxStepBehavior>,
    branches: HashMap<String, BoxBranchBehavior>,
    predicates: HashMap<String, BoxLoopPredicate>,
}

impl BehaviorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step behavior. Replaces any previous binding for `id`.
    pub fn register_step<T: StepBehavior + 'static>(&mut self, id: impl Into<String>, behavior: T) {
        self.steps.insert(id.into(), BoxStepBehavior::new(behavior));
    }

    /// Register a branch behavior. Replaces any previous binding for `id`.
    pub fn register_branch<T: BranchBehavior + 'static>(
        &mut self,
        id: impl Into<String>,
        behavior: T,
    ) {
        self.branches
            .insert(id.into(), BoxBranchBehavior::new(behavior));
    }

    /// Register a loop predicate. Replaces any previous binding for `id`.
    pub fn register_predicate<T: LoopPredicate + 'static>(
        &mut self,
        id: impl Into<String>,
        predicate: T,
    ) {
        self.predicates
            .insert(id.into(), BoxLoopPredicate::new(predicate));
    }

    pub fn step(&self, id: &str) -> Option<&BoxStepBehavior> {
        self.steps.get(id)
    }

    pub fn branch(&self, id: &str) -> Option<&BoxBranchBehavior> {
        self.branches.get(id)
    }

    pub fn predicate(&self, id: &str) -> Option<&BoxLoopPredicate> {
        self.predicates.get(id)
    }

    /// Behavior identifiers `definition` uses that have no binding of the right kind.
    pub fn missing_for(&self, definition: &WorkflowDefinition) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for step in &definition.steps {
            let unbound = match &step.config {
                StepConfig::Execute { behavior, .. } => {
                    (!self.steps.contains_key(behavior)).then_some(behavior)
                }
                StepConfig::Conditional { behavior } => {
                    (!self.branches.contains_key(behavior)).then_some(behavior)
                }
                StepConfig::Loop { predicate, .. } => {
                    (!self.predicates.contains_key(predicate)).then_some(predicate)
                }
                StepConfig::Checkpoint { .. } => None,
            };
            if let Some(id) = unbound {
                if !missing.contains(id) {
                    missing.push(id.clone());
                }
            }
        }
        missing
    }

    /// Total number of bindings across all three kinds.
    pub fn len(&self) -> usize {
        self.steps.len() + self.branches.len() + self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("steps", &self.steps.len())
            .field("branches", &self.branches.len())
            .field("predicates", &self.predicates.len())
            .finish()
    }
}
