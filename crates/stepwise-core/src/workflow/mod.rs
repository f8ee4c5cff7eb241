//! Workflow orchestration: definitions, registry, and the execution engine.
//!
//! - `definition`: YAML parsing, validation, and directory discovery
//! - `registry`: validated definitions indexed by id
//! - `engine`: the step-by-step state machine
//! - `checkpoint`: auto-proceed sweeper for timed checkpoints
//! - `lease`: per-instance mutual exclusion for callers

pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod error;
pub mod lease;
pub mod registry;

pub use checkpoint::CheckpointSweeper;
pub use engine::WorkflowEngine;
pub use error::EngineError;
pub use lease::{InstanceLease, InstanceLocks};
pub use registry::{DefinitionSummary, WorkflowRegistry};
