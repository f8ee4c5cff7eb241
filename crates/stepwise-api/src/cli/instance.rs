//! Instance lifecycle commands: start, advance, resolve, cancel, pause,
//! resume, show, list, delete, and the auto-proceed watcher.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use stepwise_core::repository::InstanceRepository;
use stepwise_core::workflow::CheckpointSweeper;
use stepwise_types::instance::{StepStatus, WorkflowInstance, WorkflowStatus};
use stepwise_types::workflow::CheckpointAction;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events;
use crate::state::AppState;

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn styled(&self) -> bool {
        !self.json && !self.quiet
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// `stepwise start <definition> [--input JSON] [--correlation-id ID]`
pub async fn start(
    state: &AppState,
    definition_id: &str,
    input: Option<&str>,
    correlation_id: Option<String>,
    out: Output,
) -> Result<()> {
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input must be valid JSON")?,
        None => Value::Object(Default::default()),
    };
    if !input.is_object() {
        bail!("--input must be a JSON object");
    }

    let mut rx = state.engine.event_bus().subscribe();
    let instance = state
        .engine
        .create_instance(definition_id, input, correlation_id)
        .await?;
    let instance = {
        let _lease = state.locks.acquire(instance.id).await;
        state.engine.advance(instance.id).await?
    };

    if out.styled() {
        println!();
        println!(
            "  {} Started '{}' as {}",
            style("*").green().bold(),
            style(definition_id).cyan(),
            style(instance.id).bold()
        );
        events::print_buffered(&mut rx);
    }
    report(&instance, out)
}

/// `stepwise advance <id>`
pub async fn advance(state: &AppState, id: Uuid, out: Output) -> Result<()> {
    let mut rx = state.engine.event_bus().subscribe();
    let instance = {
        let _lease = state.locks.acquire(id).await;
        state.engine.advance(id).await?
    };
    if out.styled() {
        events::print_buffered(&mut rx);
    }
    report(&instance, out)
}

/// `stepwise resolve <id> <action> [--edit k=v]...`
pub async fn resolve(
    state: &AppState,
    id: Uuid,
    action: CheckpointAction,
    edits: Vec<(String, Value)>,
    out: Output,
) -> Result<()> {
    if !edits.is_empty() && action != CheckpointAction::Edit {
        bail!("--edit is only accepted with the 'edit' action");
    }
    let edits: HashMap<String, Value> = edits.into_iter().collect();

    let mut rx = state.engine.event_bus().subscribe();
    let instance = {
        let _lease = state.locks.acquire(id).await;
        state.engine.resolve_checkpoint(id, action, edits).await?
    };
    if out.styled() {
        events::print_buffered(&mut rx);
    }
    report(&instance, out)
}

/// `stepwise cancel <id>`
pub async fn cancel(state: &AppState, id: Uuid, out: Output) -> Result<()> {
    // No lease: cancellation must reach an advance that holds one.
    let instance = state.engine.cancel(id).await?;
    report(&instance, out)
}

/// `stepwise pause <id>`
pub async fn pause(state: &AppState, id: Uuid, out: Output) -> Result<()> {
    let instance = {
        let _lease = state.locks.acquire(id).await;
        state.engine.pause(id).await?
    };
    report(&instance, out)
}

/// `stepwise resume <id>`
pub async fn resume(state: &AppState, id: Uuid, out: Output) -> Result<()> {
    let mut rx = state.engine.event_bus().subscribe();
    let instance = {
        let _lease = state.locks.acquire(id).await;
        state.engine.resume(id).await?
    };
    if out.styled() {
        events::print_buffered(&mut rx);
    }
    report(&instance, out)
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// `stepwise show <id>`
pub async fn show(state: &AppState, id: Uuid, out: Output) -> Result<()> {
    let instance = state.engine.get_instance(id).await?;
    if out.json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    print_summary(&instance);

    let Some(def) = state.engine.definitions().get(&instance.definition_id) else {
        println!(
            "  {}",
            style(format!("definition '{}' is no longer registered", instance.definition_id)).yellow()
        );
        println!();
        return Ok(());
    };

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Iterations"),
            Cell::new("Completed"),
        ]);

    for step in &def.steps {
        let step_state = instance.context.step_state(&step.id);
        let status = step_state.map_or(StepStatus::Pending, |s| s.status);
        let marker = if instance.current_step_id.as_deref() == Some(step.id.as_str()) {
            "> "
        } else {
            "  "
        };
        table.add_row(vec![
            Cell::new(format!("{marker}{}", step.id)),
            Cell::new(step.step_type()),
            step_status_cell(status),
            Cell::new(step_state.map_or(0, |s| s.execution_count)),
            Cell::new(
                step_state
                    .and_then(|s| s.completed_at)
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }

    println!("{table}");
    if !instance.context.user_edits.is_empty() {
        println!("  User edits:");
        let mut edits: Vec<_> = instance.context.user_edits.iter().collect();
        edits.sort_by(|a, b| a.0.cmp(b.0));
        for (field, value) in edits {
            println!("    {field} = {value}");
        }
    }
    println!();
    Ok(())
}

/// `stepwise list [--status S] [--limit N]`
pub async fn list(
    state: &AppState,
    status: Option<WorkflowStatus>,
    limit: u32,
    out: Output,
) -> Result<()> {
    let instances = state.engine.repo().list(status, limit).await?;

    if out.json {
        let rows: Vec<_> = instances
            .iter()
            .map(|i| {
                serde_json::json!({
                    "id": i.id,
                    "definition_id": i.definition_id,
                    "status": i.status,
                    "current_step_id": i.current_step_id,
                    "correlation_id": i.correlation_id,
                    "created_at": i.created_at.to_rfc3339(),
                    "updated_at": i.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow instances.");
        println!(
            "  Start one with: {}",
            style("stepwise start <definition> --input '{...}'").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Definition"),
            Cell::new("Status"),
            Cell::new("Current step"),
            Cell::new("Updated"),
        ]);

    for i in &instances {
        table.add_row(vec![
            Cell::new(i.id),
            Cell::new(&i.definition_id),
            status_cell(i.status),
            Cell::new(i.current_step_id.as_deref().unwrap_or("-")),
            Cell::new(i.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// `stepwise delete <id>`
pub async fn delete(state: &AppState, id: Uuid, out: Output) -> Result<()> {
    let deleted = {
        let _lease = state.locks.acquire(id).await;
        state.engine.repo().delete(&id).await?
    };
    state.locks.forget(id);
    if !deleted {
        bail!("Workflow instance {id} not found");
    }

    if out.json {
        println!("{}", serde_json::json!({ "id": id, "deleted": true }));
    } else if !out.quiet {
        println!();
        println!("  {} Deleted instance {id}", style("*").green().bold());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// `stepwise watch`: sweep expired checkpoints until Ctrl+C.
pub async fn watch(state: &AppState, out: Output) -> Result<()> {
    let interval = state.config.sweep_interval();
    let shutdown = CancellationToken::new();
    let sweeper = CheckpointSweeper::new(state.engine.clone(), state.locks.clone());

    if out.styled() {
        println!();
        println!(
            "  {} Watching for expired checkpoints every {}s",
            style("*").cyan().bold(),
            interval.as_secs()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let printer = {
        let mut rx = state.engine.event_bus().subscribe();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) if out.json => {
                            if let Ok(line) = serde_json::to_string(&event) {
                                println!("{line}");
                            }
                        }
                        Ok(event) if !out.quiet => {
                            println!("  {} {}", style(event.instance_id()).dim(), events::describe(&event));
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "event printer lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    };

    let ctrl_c = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            }
            shutdown.cancel();
        }
    };

    tokio::join!(sweeper.run(interval, shutdown.clone()), ctrl_c);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer task failed");
    }

    if out.styled() {
        println!("\n  Watcher stopped.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn report(instance: &WorkflowInstance, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(instance)?);
    } else if !out.quiet {
        print_summary(instance);
    }
    Ok(())
}

fn print_summary(instance: &WorkflowInstance) {
    println!();
    println!(
        "  {} {}",
        style("Instance").bold(),
        style(instance.id).cyan()
    );
    println!("  Definition: {}", instance.definition_id);
    println!("  Status: {}", styled_status(instance.status));
    if let Some(step) = &instance.current_step_id {
        println!("  Current step: {}", style(step).bold());
    }
    if let Some(correlation) = &instance.correlation_id {
        println!("  Correlation: {correlation}");
    }
    if let Some(deadline) = instance.checkpoint_deadline {
        println!(
            "  Auto-proceeds at: {}",
            deadline.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(error) = &instance.error {
        println!("  Error: {}", style(error).red());
    }
    if let Some(output) = &instance.final_output {
        let rendered =
            serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
        println!("  Final output:");
        for line in rendered.lines() {
            println!("    {line}");
        }
    }
    if instance.status == WorkflowStatus::Waiting {
        println!(
            "  Resolve with: {}",
            style(format!("stepwise resolve {} approve", instance.id)).dim()
        );
    }
    println!();
}

fn status_color(status: WorkflowStatus) -> Color {
    match status {
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
        WorkflowStatus::Waiting | WorkflowStatus::Paused => Color::Yellow,
        WorkflowStatus::Running => Color::Cyan,
        WorkflowStatus::Pending | WorkflowStatus::Cancelled => Color::DarkGrey,
    }
}

fn status_cell(status: WorkflowStatus) -> Cell {
    Cell::new(status).fg(status_color(status))
}

fn styled_status(status: WorkflowStatus) -> console::StyledObject<WorkflowStatus> {
    let s = style(status);
    match status {
        WorkflowStatus::Completed => s.green(),
        WorkflowStatus::Failed => s.red(),
        WorkflowStatus::Waiting | WorkflowStatus::Paused => s.yellow(),
        WorkflowStatus::Running => s.cyan(),
        WorkflowStatus::Pending | WorkflowStatus::Cancelled => s.dim(),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let (label, color) = match status {
        StepStatus::Pending => ("pending", Color::DarkGrey),
        StepStatus::Running => ("running", Color::Cyan),
        StepStatus::Completed => ("completed", Color::Green),
        StepStatus::Failed => ("failed", Color::Red),
        StepStatus::Skipped => ("skipped", Color::Yellow),
    };
    Cell::new(label).fg(color)
}
