//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the repository traits defined in `stepwise-core`
//! (SQLite instance storage) and the on-disk configuration loader.

pub mod config;
pub mod sqlite;
