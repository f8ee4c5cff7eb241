//! Engine configuration for Stepwise.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default, so an empty or missing file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the engine, event bus, and checkpoint sweeper.
///
/// Loaded from `~/.stepwise/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Broadcast buffer of the event bus. Slow subscribers past this lag.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Bounded progress channel size handed to each behavior call.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,

    /// Upper bound on a single behavior invocation.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Steps one `advance` call may execute before the instance is failed.
    #[serde(default = "default_max_steps_per_advance")]
    pub max_steps_per_advance: u32,

    /// How often the checkpoint sweeper looks for expired auto-proceed deadlines.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Extra directory of YAML workflow definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows_dir: Option<PathBuf>,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_progress_buffer() -> usize {
    32
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_steps_per_advance() -> u32 {
    10_000
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            progress_buffer: default_progress_buffer(),
            step_timeout_secs: default_step_timeout_secs(),
            max_steps_per_advance: default_max_steps_per_advance(),
            sweep_interval_secs: default_sweep_interval_secs(),
            workflows_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
