//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `WorkflowDefinition`, validates structural
//! constraints (unique step ids, resolvable references, checkpoint settings),
//! and discovers definition files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stepwise_types::workflow::{FinalOutputPolicy, StepConfig, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading or validating a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step references a step id that is not in the definition.
    #[error("step '{step_id}' references unknown step '{reference}'")]
    UnknownReference { step_id: String, reference: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(msg: impl Into<String>) -> DefinitionError {
    DefinitionError::ValidationError(msg.into())
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id is non-empty and made of alphanumerics, `-`, `_`, `.`
/// - At least one step exists and all step ids are unique
/// - The initial step exists
/// - Every `next_step_id`, `loop_step_id`, and `reject_step_id` names a step
/// - Checkpoints allow at least one action, and auto-proceed has a timeout > 0
/// - Loop `max_iterations` is >= 1 if set
/// - A `step` final-output policy names a step
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.is_empty() {
        return Err(invalid("definition id must not be empty"));
    }
    if !def
        .id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(format!(
            "definition id '{}' contains invalid characters",
            def.id
        )));
    }

    if def.steps.is_empty() {
        return Err(invalid("definition must have at least one step"));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(invalid("step id must not be empty"));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step ID: '{}'", step.id)));
        }
    }

    if !seen_ids.contains(def.initial_step_id.as_str()) {
        return Err(DefinitionError::UnknownReference {
            step_id: "<initial>".to_string(),
            reference: def.initial_step_id.clone(),
        });
    }

    for (step_id, target) in def.static_references() {
        if !seen_ids.contains(target) {
            return Err(DefinitionError::UnknownReference {
                step_id: step_id.to_string(),
                reference: target.to_string(),
            });
        }
    }

    for step in &def.steps {
        match &step.config {
            StepConfig::Checkpoint { checkpoint, .. } => {
                if checkpoint.allowed_actions.is_empty() {
                    return Err(invalid(format!(
                        "checkpoint '{}' must allow at least one action",
                        step.id
                    )));
                }
                if checkpoint.auto_proceed
                    && checkpoint.auto_proceed_timeout_secs.unwrap_or(0) == 0
                {
                    return Err(invalid(format!(
                        "checkpoint '{}' sets auto_proceed without a timeout > 0",
                        step.id
                    )));
                }
            }
            StepConfig::Loop {
                max_iterations: Some(0),
                ..
            } => {
                return Err(invalid(format!(
                    "loop '{}' max_iterations must be >= 1",
                    step.id
                )));
            }
            StepConfig::Execute { behavior, .. } | StepConfig::Conditional { behavior } => {
                if behavior.is_empty() {
                    return Err(invalid(format!("step '{}' has an empty behavior", step.id)));
                }
            }
            StepConfig::Loop { predicate, .. } => {
                if predicate.is_empty() {
                    return Err(invalid(format!("loop '{}' has an empty predicate", step.id)));
                }
            }
        }
    }

    if let FinalOutputPolicy::Step { step_id } = &def.final_output {
        if !seen_ids.contains(step_id.as_str()) {
            return Err(DefinitionError::UnknownReference {
                step_id: "<final_output>".to_string(),
                reference: step_id.clone(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all definition YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// or validate are skipped with a warning.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_definition_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
