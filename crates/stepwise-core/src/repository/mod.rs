//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation for tests and embedded use.

pub mod instance;
pub mod memory;

pub use instance::InstanceRepository;
pub use memory::InMemoryInstanceRepository;
