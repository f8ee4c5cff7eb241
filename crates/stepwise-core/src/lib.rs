//! Workflow engine logic and repository trait definitions for Stepwise.
//!
//! This crate defines the "ports" (repository and behavior traits) that the
//! infrastructure layer and embedding applications implement, plus the engine
//! that drives instances through their definitions. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any database/IO crate.

pub mod behavior;
pub mod event;
pub mod repository;
pub mod workflow;
