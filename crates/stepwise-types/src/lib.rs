//! Shared domain types for Stepwise.
//!
//! This crate contains the data model of the workflow engine: definitions,
//! instances and their context, engine events, configuration, and the
//! repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod workflow;
