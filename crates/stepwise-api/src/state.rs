//! Application state wiring the engine to its infrastructure.
//!
//! The engine is generic over its repository; `AppState` pins it to SQLite
//! and builds both registries once at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use stepwise_core::behavior::BehaviorRegistry;
use stepwise_core::event::EventBus;
use stepwise_core::workflow::definition::discover_definitions;
use stepwise_core::workflow::{InstanceLocks, WorkflowEngine, WorkflowRegistry};
use stepwise_infra::config::{load_engine_config, resolve_workflows_dir};
use stepwise_infra::sqlite::instance::SqliteInstanceRepository;
use stepwise_infra::sqlite::pool::{default_data_dir, DatabasePool};
use stepwise_types::config::EngineConfig;

use crate::templates::{builtin_definitions, register_builtin_behaviors};

/// Engine pinned to the SQLite instance repository.
pub type Engine = WorkflowEngine<SqliteInstanceRepository>;

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Leases taken around every mutating command.
    pub locks: InstanceLocks,
    pub config: EngineConfig,
}

impl AppState {
    /// Open the database, load config, and build the registries.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("stepwise.db").display()
        );
        let pool = DatabasePool::new(&db_url)
            .await
            .context("failed to open the instance database")?;

        let mut behaviors = BehaviorRegistry::new();
        register_builtin_behaviors(&mut behaviors);
        let definitions = build_definitions(&resolve_workflows_dir(&config, &data_dir), &behaviors)?;

        tracing::debug!(
            definitions = definitions.len(),
            behaviors = behaviors.len(),
            data_dir = %data_dir.display(),
            "application state ready"
        );

        let engine = WorkflowEngine::new(
            Arc::new(definitions),
            Arc::new(behaviors),
            SqliteInstanceRepository::new(pool),
            EventBus::new(config.event_capacity),
            config.clone(),
        );

        Ok(Self {
            engine: Arc::new(engine),
            locks: InstanceLocks::new(),
            config,
        })
    }
}

/// Built-in templates plus every valid YAML definition under `workflows_dir`.
///
/// A user file whose id clashes with an already registered definition, or
/// that fails validation, is skipped with a warning. Definitions referencing
/// unbound behaviors are registered anyway; their steps fail when reached.
pub fn build_definitions(
    workflows_dir: &Path,
    behaviors: &BehaviorRegistry,
) -> anyhow::Result<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    for def in builtin_definitions().context("built-in template is invalid")? {
        registry.register(def)?;
    }

    let discovered = discover_definitions(workflows_dir)
        .with_context(|| format!("failed to scan {}", workflows_dir.display()))?;
    for (path, def) in discovered {
        let missing = behaviors.missing_for(&def);
        let definition_id = def.id.clone();
        if let Err(e) = registry.register(def) {
            tracing::warn!(path = %path.display(), error = %e, "skipping workflow definition");
            continue;
        }
        if !missing.is_empty() {
            tracing::warn!(
                definition_id = definition_id.as_str(),
                missing = ?missing,
                "definition references unbound behaviors"
            );
        }
    }
    Ok(registry)
}
