//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing. Definitions are read-only
//! (built-in templates plus YAML files); instances live in SQLite.

pub mod definition;
pub mod events;
pub mod instance;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use stepwise_types::instance::WorkflowStatus;
use stepwise_types::workflow::CheckpointAction;
use uuid::Uuid;

/// Drive multi-step workflows with human checkpoints.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (database, config.toml, workflows/).
    #[arg(long, global = true, env = "STEPWISE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered workflow definitions.
    Definitions {
        /// Only show definitions in this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Show one workflow definition and its steps.
    Definition {
        /// Definition id.
        id: String,
    },

    /// Create an instance of a definition and advance it.
    Start {
        /// Definition id.
        definition: String,

        /// Initial input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Correlation id linking the instance to an outside session.
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Advance a pending or running instance.
    Advance {
        /// Instance id.
        id: Uuid,
    },

    /// Resolve the checkpoint an instance is waiting at.
    Resolve {
        /// Instance id.
        id: Uuid,

        /// approve, edit, reject, or skip.
        action: CheckpointAction,

        /// Field edit as key=value (value parsed as JSON, else taken as text).
        #[arg(long = "edit", value_parser = parse_edit)]
        edits: Vec<(String, Value)>,
    },

    /// Cancel a non-terminal instance.
    Cancel {
        /// Instance id.
        id: Uuid,
    },

    /// Pause a pending or running instance.
    Pause {
        /// Instance id.
        id: Uuid,
    },

    /// Resume a paused instance.
    Resume {
        /// Instance id.
        id: Uuid,
    },

    /// Show an instance with its step states.
    Show {
        /// Instance id.
        id: Uuid,
    },

    /// List instances, newest first.
    #[command(alias = "ls")]
    List {
        /// Only show instances with this status.
        #[arg(long)]
        status: Option<WorkflowStatus>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Delete a stored instance.
    #[command(alias = "rm")]
    Delete {
        /// Instance id.
        id: Uuid,
    },

    /// Auto-proceed expired checkpoints until Ctrl+C.
    Watch,
}

/// Parse `key=value`; the value is JSON when it parses, else a string.
fn parse_edit(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty field name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
