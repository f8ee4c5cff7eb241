//! Styled rendering of engine events for the terminal.

use console::style;
use stepwise_types::event::EngineEvent;
use tokio::sync::broadcast;

/// One human-readable line for an event.
pub fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::StepStarted {
            step_id, step_type, ..
        } => format!("{} {step_id} ({step_type})", style("▸").cyan()),
        EngineEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => format!(
            "{} {step_id} {}",
            style("✓").green(),
            style(format!("{duration_ms}ms")).dim()
        ),
        EngineEvent::StepProgress {
            step_id, message, ..
        } => format!("  {} {step_id}: {message}", style("…").dim()),
        EngineEvent::StepFailed { step_id, error, .. } => {
            format!("{} {step_id}: {}", style("✗").red(), style(error).red())
        }
        EngineEvent::CheckpointReached {
            step_id, config, ..
        } => format!(
            "{} waiting at {step_id}: {}",
            style("⏸").yellow(),
            style(&config.title).bold()
        ),
        EngineEvent::CheckpointResolved {
            step_id, action, ..
        } => format!("{} {step_id} resolved: {action}", style("→").cyan()),
        EngineEvent::WorkflowCompleted { .. } => {
            format!("{} workflow completed", style("✓").green().bold())
        }
        EngineEvent::WorkflowFailed { error, .. } => {
            format!("{} workflow failed: {}", style("✗").red().bold(), error)
        }
        EngineEvent::WorkflowCancelled { .. } => {
            format!("{} workflow cancelled", style("■").yellow())
        }
        EngineEvent::WorkflowPaused { .. } => format!("{} workflow paused", style("⏸").yellow()),
    }
}

/// Print whatever is buffered on `rx` without waiting for more.
pub fn print_buffered(rx: &mut broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.try_recv() {
            Ok(event) => println!("  {}", describe(&event)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                println!("  {}", style(format!("({n} events dropped)")).dim());
            }
            Err(_) => break,
        }
    }
}
