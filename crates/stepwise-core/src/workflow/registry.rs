//! Workflow definition registry.
//!
//! An in-memory catalogue of validated, immutable definitions keyed by id.
//! Built once at startup through `&mut self` registration, then shared as
//! `Arc<WorkflowRegistry>`; lookups take no locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use stepwise_types::workflow::WorkflowDefinition;

use super::definition::validate_definition;
use super::error::EngineError;

/// Compact view of a definition for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinitionSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub step_count: usize,
}

impl From<&WorkflowDefinition> for DefinitionSummary {
    fn from(def: &WorkflowDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            category: def.category.clone(),
            icon: def.icon.clone(),
            step_count: def.steps.len(),
        }
    }
}

/// Registry of workflow definitions, indexed by id.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    /// Registration order, so listings are stable.
    order: Vec<String>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        if self.definitions.contains_key(&definition.id) {
            return Err(EngineError::DuplicateDefinition(definition.id));
        }
        validate_definition(&definition).map_err(|e| EngineError::InvalidDefinition {
            id: definition.id.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(
            definition_id = definition.id.as_str(),
            steps = definition.steps.len(),
            "registered workflow definition"
        );
        self.order.push(definition.id.clone());
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Look up a definition by id.
    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    /// Definitions in `category`, in registration order.
    pub fn list_by_category(&self, category: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.iter()
            .filter(|def| def.category == category)
            .cloned()
            .collect()
    }

    /// Every definition, in registration order.
    pub fn list_all(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.iter().cloned().collect()
    }

    /// Distinct categories, sorted.
    pub fn list_categories(&self) -> Vec<String> {
        self.definitions
            .values()
            .map(|def| def.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Summaries of every definition, optionally restricted to one category.
    pub fn summaries(&self, category: Option<&str>) -> Vec<DefinitionSummary> {
        self.iter()
            .filter(|def| category.is_none_or(|c| def.category == c))
            .map(|def| DefinitionSummary::from(def.as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<WorkflowDefinition>> {
        self.order.iter().filter_map(|id| self.definitions.get(id))
    }
}
