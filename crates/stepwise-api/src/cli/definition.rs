//! Definition listing and inspection commands.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepwise_types::workflow::{StepConfig, StepDefinition};

use crate::state::AppState;

/// `stepwise definitions [--category C]`
pub fn list_definitions(state: &AppState, category: Option<&str>, json: bool) -> Result<()> {
    let registry = state.engine.definitions();
    let summaries = registry.summaries(category);

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!();
        match category {
            Some(c) => println!("  No workflow definitions in category '{c}'."),
            None => println!("  No workflow definitions registered."),
        }
        println!(
            "  Categories: {}",
            style(registry.list_categories().join(", ")).dim()
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
            Cell::new("Name"),
            Cell::new("Category"),
            Cell::new("Steps"),
            Cell::new("Description"),
        ]);

    for s in &summaries {
        table.add_row(vec![
            Cell::new(&s.id),
            Cell::new(&s.name),
            Cell::new(&s.category),
            Cell::new(s.step_count),
            Cell::new(&s.description),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// `stepwise definition <id>`
pub fn show_definition(state: &AppState, id: &str, json: bool) -> Result<()> {
    let def = state
        .engine
        .definitions()
        .get(id)
        .ok_or_else(|| anyhow!("Workflow definition '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(def.as_ref())?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style(&def.name).bold(),
        style(format!("({})", def.id)).dim()
    );
    if !def.description.is_empty() {
        println!("  {}", def.description);
    }
    println!("  Category: {}", style(&def.category).cyan());
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Binding"),
            Cell::new("Next"),
        ]);

    for step in &def.steps {
        let marker = if step.id == def.initial_step_id { "*" } else { "" };
        table.add_row(vec![
            Cell::new(format!("{marker}{}", step.id)),
            Cell::new(step.step_type()),
            Cell::new(step.config.behavior_id().unwrap_or("-")),
            Cell::new(describe_next(step)),
        ]);
    }

    println!("{table}");
    println!("  {}", style("* initial step").dim());
    println!();
    Ok(())
}

/// Where control goes after `step`, as shown in the step table.
fn describe_next(step: &StepDefinition) -> String {
    let or_end = |id: &Option<String>| id.clone().unwrap_or_else(|| "end".to_string());
    match &step.config {
        StepConfig::Execute { next_step_id, .. } => or_end(next_step_id),
        StepConfig::Checkpoint {
            next_step_id,
            reject_step_id,
            ..
        } => match reject_step_id {
            Some(reject) => format!("{} (reject: {reject})", or_end(next_step_id)),
            None => or_end(next_step_id),
        },
        StepConfig::Conditional { .. } => "branch".to_string(),
        StepConfig::Loop {
            loop_step_id,
            next_step_id,
            ..
        } => format!("{loop_step_id} while true, then {}", or_end(next_step_id)),
    }
}
