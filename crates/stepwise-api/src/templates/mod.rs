//! Built-in workflow templates and the deterministic behaviors they use.
//!
//! Templates are YAML files embedded in the binary and parsed at startup,
//! the same format users drop into `{data_dir}/workflows`.

use serde_json::{json, Value};
use stepwise_core::behavior::{
    branch_fn, predicate_fn, step_fn, BehaviorError, BehaviorRegistry, StepBehavior, StepCall,
};
use stepwise_core::workflow::definition::{parse_definition_yaml, DefinitionError};
use stepwise_types::instance::{ContextValue, WorkflowContext};
use stepwise_types::workflow::{ContentType, StepOutput, WorkflowDefinition};

const RESEARCH_YAML: &str = include_str!("research.yaml");
const APPROVAL_YAML: &str = include_str!("approval.yaml");

const DEFAULT_MAX_SOURCES: i64 = 3;

/// Parse every built-in template.
pub fn builtin_definitions() -> Result<Vec<WorkflowDefinition>, DefinitionError> {
    [RESEARCH_YAML, APPROVAL_YAML]
        .into_iter()
        .map(parse_definition_yaml)
        .collect()
}

/// Bind every behavior the built-in templates reference.
pub fn register_builtin_behaviors(registry: &mut BehaviorRegistry) {
    // -- research ----------------------------------------------------------
    registry.register_step("research.frame_question", step_fn(frame_question));
    registry.register_step("research.gather_source", GatherSource);
    registry.register_predicate(
        "research.needs_more_sources",
        predicate_fn(|ctx| Ok(ctx.counter("sources") < max_sources(ctx))),
    );
    registry.register_branch(
        "research.route_depth",
        branch_fn(|ctx| {
            let brief = ctx.input_field("depth").and_then(Value::as_str) == Some("brief");
            Ok(if brief { "brief" } else { "full" }.to_string())
        }),
    );
    registry.register_step("research.write_brief", step_fn(write_brief));
    registry.register_step("research.write_full_report", step_fn(write_full_report));

    // -- approval ----------------------------------------------------------
    registry.register_step("approval.draft", step_fn(draft));
    registry.register_step("approval.publish", step_fn(publish));
}

// ---------------------------------------------------------------------------
// Research behaviors
// ---------------------------------------------------------------------------

fn max_sources(ctx: &WorkflowContext) -> i64 {
    ctx.input_field("max_sources")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_MAX_SOURCES)
        .max(1)
}

/// The research question, preferring a checkpoint edit over the framed one.
fn question(ctx: &WorkflowContext) -> String {
    ctx.get_user_edit("question")
        .or_else(|| ctx.get_step_output("frame").and_then(|o| o.get("question")))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn frame_question(ctx: &mut WorkflowContext) -> Result<StepOutput, BehaviorError> {
    let Some(topic) = ctx.input_field("topic").and_then(Value::as_str) else {
        return Ok(StepOutput::failure("input field 'topic' is required"));
    };
    let question = format!("What is currently known about {topic}?");
    Ok(
        StepOutput::success(json!({ "topic": topic, "question": question }))
            .with_display("Research question", question, ContentType::Text),
    )
}

/// Records one numbered source per call and reports progress while doing it.
struct GatherSource;

impl StepBehavior for GatherSource {
    async fn execute(&self, call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
        if call.is_cancelled() {
            return Err(BehaviorError::Cancelled);
        }
        let n = call.context.counter("sources") + 1;
        call.report(format!("gathering source {n}"));

        let ctx = call.context;
        ctx.increment_counter("sources");
        let note = format!("Source {n} on: {}", question(ctx));

        let mut notes = match ctx.get_variable("source_notes") {
            Some(ContextValue::Json(Value::Array(notes))) => notes.clone(),
            _ => Vec::new(),
        };
        notes.push(Value::String(note.clone()));
        ctx.set_variable("source_notes", ContextValue::Json(Value::Array(notes)));

        Ok(StepOutput::success(json!({ "source": n, "note": note })))
    }
}

fn write_brief(ctx: &mut WorkflowContext) -> Result<StepOutput, BehaviorError> {
    let sources = ctx.counter("sources");
    let report = format!("Brief on '{}' drawing on {sources} sources.", question(ctx));
    Ok(
        StepOutput::success(json!({ "report": report, "sources": sources }))
            .with_display("Research brief", report, ContentType::Markdown),
    )
}

fn write_full_report(ctx: &mut WorkflowContext) -> Result<StepOutput, BehaviorError> {
    let sources = ctx.counter("sources");
    let mut report = format!("# {}\n", question(ctx));
    if let Some(ContextValue::Json(Value::Array(notes))) = ctx.get_variable("source_notes") {
        for note in notes.iter().filter_map(Value::as_str) {
            report.push_str(&format!("\n- {note}"));
        }
    }
    Ok(
        StepOutput::success(json!({ "report": report, "sources": sources }))
            .with_display("Research report", report, ContentType::Markdown),
    )
}

// ---------------------------------------------------------------------------
// Approval behaviors
// ---------------------------------------------------------------------------

fn draft(ctx: &mut WorkflowContext) -> Result<StepOutput, BehaviorError> {
    let revision = ctx.increment_counter("revisions");
    let base = ctx
        .input_field("text")
        .and_then(Value::as_str)
        .unwrap_or("Untitled draft");
    let text = if revision > 1 {
        format!("{base} (revision {revision})")
    } else {
        base.to_string()
    };
    Ok(StepOutput::success(json!({ "text": text, "revision": revision })))
}

fn publish(ctx: &mut WorkflowContext) -> Result<StepOutput, BehaviorError> {
    let text = ctx
        .get_user_edit("text")
        .or_else(|| ctx.get_step_output("draft").and_then(|o| o.get("text")))
        .and_then(Value::as_str)
        .ok_or_else(|| BehaviorError::failed("no draft text to publish"))?
        .to_string();
    Ok(StepOutput::success(
        json!({ "published": text, "revisions": ctx.counter("revisions") }),
    ))
}
