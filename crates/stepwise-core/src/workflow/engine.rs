//! Workflow engine: the state machine that drives instances through definitions.
//!
//! The `WorkflowEngine` executes one step at a time for an instance, computes
//! the next step from the step's type, and persists after every transition so
//! an instance can be resumed after a restart or a long human delay.
//!
//! # Advance flow
//!
//! 1. Load the instance; only `pending` and `running` instances advance.
//! 2. Resolve the current step; mark it `running` and emit `StepStarted`.
//! 3. Dispatch by type: execute -> behavior output; checkpoint -> suspend;
//!    conditional -> branch target; loop -> predicate.
//! 4. Move to the next step, or complete when there is none.
//! 5. Repeat until the instance is no longer `running`.
//!
//! Step failures terminate the instance in `failed` and are reported on the
//! returned instance, not as `Err`. Caller mistakes (unknown ids, invalid
//! transitions, rejected checkpoint decisions) return `Err` without touching
//! stored state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::EngineEvent;
use stepwise_types::instance::{StepStatus, WorkflowContext, WorkflowInstance, WorkflowStatus};
use stepwise_types::workflow::{
    CheckpointAction, CheckpointConfig, FinalOutputPolicy, StepConfig, StepDefinition, StepType,
    WorkflowDefinition,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::behavior::{BehaviorError, BehaviorRegistry, ProgressSender, StepCall};
use crate::event::EventBus;
use crate::repository::InstanceRepository;

use super::error::EngineError;
use super::registry::WorkflowRegistry;

// ---------------------------------------------------------------------------
// Internal outcomes
// ---------------------------------------------------------------------------

/// What a single step decided.
enum StepOutcome {
    /// Move to this step, or finish when `None`.
    Next(Option<String>),
    /// Suspend at a checkpoint.
    Wait,
    /// The step failed; the instance fails with it.
    Failed(String),
    /// The cancellation token fired mid-step.
    Cancelled,
}

/// How a supervised behavior call ended.
enum Invocation<T> {
    Done(Result<T, BehaviorError>),
    TimedOut,
}

/// The checkpoint an instance is waiting at.
struct WaitingCheckpoint<'a> {
    step: &'a StepDefinition,
    config: &'a CheckpointConfig,
    next_step_id: Option<&'a str>,
    reject_step_id: Option<&'a str>,
}

fn step_error(step_id: &str, message: impl Into<String>) -> String {
    EngineError::StepExecution {
        step_id: step_id.to_string(),
        message: message.into(),
    }
    .to_string()
}

fn invalid_transition(instance: &WorkflowInstance, operation: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        instance_id: instance.id,
        status: instance.status,
        operation,
    }
}

fn deadline_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    now.checked_add_signed(TimeDelta::try_seconds(secs)?)
}

/// Compute an instance's final output from its definition's policy.
pub fn final_output(definition: &WorkflowDefinition, context: &WorkflowContext) -> Option<Value> {
    match &definition.final_output {
        FinalOutputPolicy::LastStep => context
            .step_history
            .iter()
            .rev()
            .filter(|id| {
                definition
                    .get_step(id)
                    .is_some_and(|s| s.step_type() == StepType::Execute)
            })
            .find_map(|id| context.step_data.get(id.as_str()).cloned()),
        FinalOutputPolicy::Step { step_id } => context.step_data.get(step_id).cloned(),
        FinalOutputPolicy::AllSteps => Some(Value::Object(
            context
                .step_data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )),
        FinalOutputPolicy::None => None,
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Deterministic workflow engine.
///
/// Generic over `R: InstanceRepository` for storage flexibility. Registries
/// are injected and shared read-only; the only mutable shared state is the
/// map of cancellation tokens for advances in flight.
pub struct WorkflowEngine<R: InstanceRepository> {
    definitions: Arc<WorkflowRegistry>,
    behaviors: Arc<BehaviorRegistry>,
    repo: R,
    event_bus: EventBus,
    config: EngineConfig,
    /// Cancellation tokens of in-flight advances, keyed by instance id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: InstanceRepository> WorkflowEngine<R> {
    pub fn new(
        definitions: Arc<WorkflowRegistry>,
        behaviors: Arc<BehaviorRegistry>,
        repo: R,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            behaviors,
            repo,
            event_bus,
            config,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn definitions(&self) -> &WorkflowRegistry {
        &self.definitions
    }

    pub fn behaviors(&self) -> &BehaviorRegistry {
        &self.behaviors
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn definition(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .get(definition_id)
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Create and persist a `pending` instance of `definition_id`.
    pub async fn create_instance(
        &self,
        definition_id: &str,
        input: Value,
        correlation_id: Option<String>,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self.definition(definition_id)?;
        let instance = WorkflowInstance::create(&definition, input, correlation_id);
        self.repo.save(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition_id,
            "created workflow instance"
        );
        Ok(instance)
    }

    /// Create an instance and advance it until it stops.
    pub async fn start(
        &self,
        definition_id: &str,
        input: Value,
        correlation_id: Option<String>,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .create_instance(definition_id, input, correlation_id)
            .await?;
        self.advance(instance.id).await
    }

    /// Load an instance by id.
    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.repo
            .get(&instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Drive a `pending` or `running` instance until it waits, pauses, or ends.
    pub async fn advance(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let instance = self.get_instance(instance_id).await?;
        if !instance.status.is_advanceable() {
            return Err(invalid_transition(&instance, "advance"));
        }
        let definition = self.definition(&instance.definition_id)?;
        self.drive(&definition, instance).await
    }

    /// Apply a human decision to a `waiting` instance, then keep advancing.
    ///
    /// `edits` are only read for `edit`, and every key must be an editable
    /// field of the checkpoint.
    pub async fn resolve_checkpoint(
        &self,
        instance_id: Uuid,
        action: CheckpointAction,
        edits: HashMap<String, Value>,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self.get_instance(instance_id).await?;
        if instance.status != WorkflowStatus::Waiting {
            return Err(invalid_transition(&instance, "resolve a checkpoint for"));
        }
        let definition = self.definition(&instance.definition_id)?;
        let checkpoint = waiting_checkpoint(&definition, &instance)?;

        if !checkpoint.config.allows(action) {
            return Err(EngineError::InvalidCheckpointAction {
                step_id: checkpoint.step.id.clone(),
                action,
            });
        }
        if action == CheckpointAction::Edit {
            if let Some(field) = edits.keys().find(|f| !checkpoint.config.is_editable(f)) {
                return Err(EngineError::InvalidEditableField {
                    step_id: checkpoint.step.id.clone(),
                    field: field.clone(),
                });
            }
        }

        self.apply_decision(&definition, &checkpoint, instance, action, edits)
            .await
    }

    /// Approve a `waiting` instance whose auto-proceed deadline has passed.
    ///
    /// Returns `None` when the checkpoint has no deadline or it is still in
    /// the future.
    pub async fn auto_proceed(
        &self,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        let instance = self.get_instance(instance_id).await?;
        if instance.status != WorkflowStatus::Waiting {
            return Err(invalid_transition(&instance, "auto-proceed"));
        }
        if !instance.checkpoint_deadline.is_some_and(|d| d <= now) {
            return Ok(None);
        }
        let definition = self.definition(&instance.definition_id)?;
        let checkpoint = waiting_checkpoint(&definition, &instance)?;

        tracing::info!(
            instance_id = %instance_id,
            step_id = checkpoint.step.id.as_str(),
            "auto-proceeding past checkpoint"
        );
        self.apply_decision(
            &definition,
            &checkpoint,
            instance,
            CheckpointAction::Approve,
            HashMap::new(),
        )
        .await
        .map(Some)
    }

    /// Cancel a non-terminal instance.
    ///
    /// An advance in flight observes the token and stops at the next step
    /// boundary; its behavior sees `StepCall::cancel` fire.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let mut instance = self.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(invalid_transition(&instance, "cancel"));
        }

        if let Some(token) = self.cancellation_tokens.get(&instance_id) {
            token.cancel();
        }

        instance.status = WorkflowStatus::Cancelled;
        instance.current_step_id = None;
        instance.checkpoint_deadline = None;
        self.save(&mut instance).await?;

        self.event_bus
            .publish(EngineEvent::WorkflowCancelled { instance_id });
        tracing::info!(instance_id = %instance_id, "workflow cancelled");
        Ok(instance)
    }

    /// Pause a `pending` or `running` instance.
    pub async fn pause(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let mut instance = self.get_instance(instance_id).await?;
        if !instance.status.is_advanceable() {
            return Err(invalid_transition(&instance, "pause"));
        }

        instance.status = WorkflowStatus::Paused;
        self.save(&mut instance).await?;

        self.event_bus
            .publish(EngineEvent::WorkflowPaused { instance_id });
        tracing::info!(instance_id = %instance_id, "workflow paused");
        Ok(instance)
    }

    /// Resume a `paused` instance and advance it.
    pub async fn resume(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let instance = self.get_instance(instance_id).await?;
        if instance.status != WorkflowStatus::Paused {
            return Err(invalid_transition(&instance, "resume"));
        }
        let definition = self.definition(&instance.definition_id)?;

        tracing::info!(instance_id = %instance_id, "resuming workflow");
        self.drive(&definition, instance).await
    }

    // -----------------------------------------------------------------------
    // Checkpoint decisions
    // -----------------------------------------------------------------------

    async fn apply_decision(
        &self,
        definition: &WorkflowDefinition,
        checkpoint: &WaitingCheckpoint<'_>,
        mut instance: WorkflowInstance,
        action: CheckpointAction,
        edits: HashMap<String, Value>,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance_id = instance.id;
        let step_id = checkpoint.step.id.clone();
        instance.checkpoint_deadline = None;

        let next = match action {
            CheckpointAction::Approve => checkpoint.next_step_id,
            CheckpointAction::Edit => {
                instance.context.user_edits.extend(edits);
                checkpoint.next_step_id
            }
            CheckpointAction::Skip => {
                instance.context.step_state_mut(&step_id).status = StepStatus::Skipped;
                checkpoint.next_step_id
            }
            CheckpointAction::Reject => match checkpoint.reject_step_id {
                Some(target) => Some(target),
                None => {
                    instance.status = WorkflowStatus::Cancelled;
                    instance.current_step_id = None;
                    self.save(&mut instance).await?;

                    self.event_bus.publish(EngineEvent::CheckpointResolved {
                        instance_id,
                        step_id,
                        action,
                    });
                    self.event_bus
                        .publish(EngineEvent::WorkflowCancelled { instance_id });
                    tracing::info!(instance_id = %instance_id, "checkpoint rejected, workflow cancelled");
                    return Ok(instance);
                }
            },
        };

        instance.current_step_id = next.map(String::from);
        instance.status = WorkflowStatus::Running;
        self.save(&mut instance).await?;

        self.event_bus.publish(EngineEvent::CheckpointResolved {
            instance_id,
            step_id: step_id.clone(),
            action,
        });
        tracing::info!(
            instance_id = %instance_id,
            step_id = step_id.as_str(),
            action = %action,
            "checkpoint resolved"
        );

        self.drive(definition, instance).await
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Run steps under a fresh cancellation token, then hand back the instance.
    ///
    /// If the instance was cancelled meanwhile, the stored (cancelled) copy
    /// is returned instead of the in-memory one.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance_id = instance.id;
        let token = self
            .cancellation_tokens
            .entry(instance_id)
            .or_default()
            .clone();

        let result = self.run_steps(definition, &mut instance, &token).await;
        self.cancellation_tokens.remove(&instance_id);
        result?;

        if token.is_cancelled() {
            tracing::debug!(instance_id = %instance_id, "advance stopped by cancellation");
            return self.get_instance(instance_id).await;
        }
        Ok(instance)
    }

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        if instance.status != WorkflowStatus::Running {
            instance.status = WorkflowStatus::Running;
            if !self.persist(instance, token).await? {
                return Ok(());
            }
        }

        let mut executed: u32 = 0;
        while instance.status == WorkflowStatus::Running {
            if token.is_cancelled() {
                return Ok(());
            }

            let Some(step_id) = instance.current_step_id.clone() else {
                self.complete(definition, instance, token).await?;
                break;
            };

            if executed >= self.config.max_steps_per_advance {
                let error = format!(
                    "exceeded {} steps in a single advance (last step '{step_id}')",
                    self.config.max_steps_per_advance
                );
                self.fail(instance, None, error, token).await?;
                break;
            }
            executed += 1;

            let Some(step) = definition.get_step(&step_id) else {
                let error = EngineError::UnknownStepReference {
                    reference: step_id,
                    origin: "current step".to_string(),
                };
                self.fail(instance, None, error.to_string(), token).await?;
                break;
            };

            match self.execute_step(definition, step, instance, token).await? {
                StepOutcome::Next(next) => {
                    tracing::debug!(
                        instance_id = %instance.id,
                        from = step.id.as_str(),
                        to = next.as_deref().unwrap_or("<end>"),
                        "step transition"
                    );
                    instance.current_step_id = next;
                    if !self.persist(instance, token).await? {
                        return Ok(());
                    }
                }
                StepOutcome::Wait => {
                    let Some(config) = step.config.checkpoint() else {
                        break;
                    };
                    instance.status = WorkflowStatus::Waiting;
                    instance.checkpoint_deadline = if config.auto_proceed {
                        config
                            .auto_proceed_timeout_secs
                            .and_then(|secs| deadline_after(Utc::now(), secs))
                    } else {
                        None
                    };
                    if !self.persist(instance, token).await? {
                        return Ok(());
                    }

                    self.event_bus.publish(EngineEvent::CheckpointReached {
                        instance_id: instance.id,
                        step_id: step.id.clone(),
                        config: config.clone(),
                    });
                    tracing::info!(
                        instance_id = %instance.id,
                        step_id = step.id.as_str(),
                        "waiting at checkpoint"
                    );
                }
                StepOutcome::Failed(error) => {
                    self.fail(instance, Some(&step.id), error, token).await?;
                }
                StepOutcome::Cancelled => return Ok(()),
            }
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        {
            let state = instance.context.step_state_mut(&step.id);
            state.status = StepStatus::Running;
            state.started_at = Some(Utc::now());
            state.completed_at = None;
            state.error = None;
        }
        instance.context.step_history.push(step.id.clone());
        if !self.persist(instance, token).await? {
            return Ok(StepOutcome::Cancelled);
        }

        self.event_bus.publish(EngineEvent::StepStarted {
            instance_id: instance.id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: step.step_type(),
        });
        tracing::debug!(
            instance_id = %instance.id,
            step_id = step.id.as_str(),
            step_type = %step.step_type(),
            "step started"
        );

        let outcome = match &step.config {
            StepConfig::Execute {
                behavior,
                next_step_id,
            } => {
                self.run_execute(definition, step, behavior, next_step_id, instance, token)
                    .await
            }
            StepConfig::Checkpoint { .. } => {
                let state = instance.context.step_state_mut(&step.id);
                state.status = StepStatus::Completed;
                state.completed_at = Some(Utc::now());
                StepOutcome::Wait
            }
            StepConfig::Conditional { behavior } => {
                self.run_conditional(definition, step, behavior, instance, token)
                    .await
            }
            StepConfig::Loop {
                predicate,
                loop_step_id,
                next_step_id,
                max_iterations,
            } => {
                self.run_loop(
                    definition,
                    step,
                    predicate,
                    loop_step_id,
                    next_step_id,
                    *max_iterations,
                    instance,
                    token,
                )
                .await
            }
        };
        Ok(outcome)
    }

    async fn run_execute(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        behavior_id: &str,
        next_step_id: &Option<String>,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> StepOutcome {
        let Some(behavior) = self.behaviors.step(behavior_id) else {
            return StepOutcome::Failed(
                EngineError::BehaviorNotFound(behavior_id.to_string()).to_string(),
            );
        };

        let instance_id = instance.id;
        let started = Instant::now();
        let (tx, rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let call = StepCall {
            definition,
            step,
            context: &mut instance.context,
            cancel: token.clone(),
            progress: ProgressSender::new(tx),
        };
        let invocation = self
            .supervise(instance_id, &step.id, rx, behavior.execute(call))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match self.settle(invocation, &step.id, token) {
            Ok(output) => output,
            Err(outcome) => return outcome,
        };

        if !output.success {
            let message = output
                .error
                .clone()
                .unwrap_or_else(|| "behavior reported failure".to_string());
            instance.context.step_state_mut(&step.id).output = Some(output);
            return StepOutcome::Failed(step_error(&step.id, message));
        }

        instance
            .context
            .step_data
            .insert(step.id.clone(), output.data.clone());
        let state = instance.context.step_state_mut(&step.id);
        state.status = StepStatus::Completed;
        state.completed_at = Some(Utc::now());
        state.output = Some(output.clone());

        self.event_bus.publish(EngineEvent::StepCompleted {
            instance_id,
            step_id: step.id.clone(),
            output,
            duration_ms,
        });
        tracing::debug!(
            instance_id = %instance_id,
            step_id = step.id.as_str(),
            duration_ms,
            "step completed"
        );

        StepOutcome::Next(next_step_id.clone())
    }

    async fn run_conditional(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        behavior_id: &str,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> StepOutcome {
        let Some(branch) = self.behaviors.branch(behavior_id) else {
            return StepOutcome::Failed(
                EngineError::BehaviorNotFound(behavior_id.to_string()).to_string(),
            );
        };

        let instance_id = instance.id;
        let (tx, rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let call = StepCall {
            definition,
            step,
            context: &mut instance.context,
            cancel: token.clone(),
            progress: ProgressSender::new(tx),
        };
        let invocation = self
            .supervise(instance_id, &step.id, rx, branch.branch(call))
            .await;
        let target = match self.settle(invocation, &step.id, token) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };

        if !definition.has_step(&target) {
            return StepOutcome::Failed(
                EngineError::UnknownStepReference {
                    reference: target,
                    origin: format!("branch target of '{}'", step.id),
                }
                .to_string(),
            );
        }

        let state = instance.context.step_state_mut(&step.id);
        state.status = StepStatus::Completed;
        state.completed_at = Some(Utc::now());
        tracing::debug!(
            instance_id = %instance_id,
            step_id = step.id.as_str(),
            target = target.as_str(),
            "branch taken"
        );
        StepOutcome::Next(Some(target))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        predicate_id: &str,
        loop_step_id: &str,
        next_step_id: &Option<String>,
        max_iterations: Option<u32>,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> StepOutcome {
        let instance_id = instance.id;
        let iterations = instance
            .context
            .step_state(&step.id)
            .map_or(0, |s| s.execution_count);

        let again = if max_iterations.is_some_and(|max| iterations >= max) {
            tracing::debug!(
                instance_id = %instance_id,
                step_id = step.id.as_str(),
                iterations,
                "loop reached max_iterations"
            );
            false
        } else {
            let Some(predicate) = self.behaviors.predicate(predicate_id) else {
                return StepOutcome::Failed(
                    EngineError::BehaviorNotFound(predicate_id.to_string()).to_string(),
                );
            };
            let (tx, rx) = mpsc::channel(self.config.progress_buffer.max(1));
            let call = StepCall {
                definition,
                step,
                context: &mut instance.context,
                cancel: token.clone(),
                progress: ProgressSender::new(tx),
            };
            let invocation = self
                .supervise(instance_id, &step.id, rx, predicate.should_continue(call))
                .await;
            match self.settle(invocation, &step.id, token) {
                Ok(again) => again,
                Err(outcome) => return outcome,
            }
        };

        let state = instance.context.step_state_mut(&step.id);
        if again {
            state.execution_count += 1;
            state.status = StepStatus::Pending;
            StepOutcome::Next(Some(loop_step_id.to_string()))
        } else {
            state.status = StepStatus::Completed;
            state.completed_at = Some(Utc::now());
            StepOutcome::Next(next_step_id.clone())
        }
    }

    /// Await a behavior call under the step timeout, forwarding its progress
    /// messages to the event bus.
    ///
    /// Cancellation is cooperative: the behavior observes `StepCall::cancel`
    /// and is always awaited to completion or timeout.
    async fn supervise<T>(
        &self,
        instance_id: Uuid,
        step_id: &str,
        mut progress: mpsc::Receiver<String>,
        call: impl Future<Output = Result<T, BehaviorError>>,
    ) -> Invocation<T> {
        let call = tokio::time::timeout(self.config.step_timeout(), call);
        tokio::pin!(call);

        let invocation = loop {
            tokio::select! {
                biased;
                Some(message) = progress.recv() => {
                    self.publish_progress(instance_id, step_id, message);
                }
                result = &mut call => {
                    break match result {
                        Ok(done) => Invocation::Done(done),
                        Err(_) => Invocation::TimedOut,
                    };
                }
            }
        };

        while let Ok(message) = progress.try_recv() {
            self.publish_progress(instance_id, step_id, message);
        }
        invocation
    }

    fn publish_progress(&self, instance_id: Uuid, step_id: &str, message: String) {
        self.event_bus.publish(EngineEvent::StepProgress {
            instance_id,
            step_id: step_id.to_string(),
            message,
        });
    }

    /// Turn anything but a successful behavior result into a step outcome.
    ///
    /// Once the token has fired, the result of the call is discarded.
    fn settle<T>(
        &self,
        invocation: Invocation<T>,
        step_id: &str,
        token: &CancellationToken,
    ) -> Result<T, StepOutcome> {
        if token.is_cancelled() {
            return Err(StepOutcome::Cancelled);
        }
        match invocation {
            Invocation::Done(Ok(value)) => Ok(value),
            Invocation::Done(Err(e)) => Err(StepOutcome::Failed(step_error(step_id, e.to_string()))),
            Invocation::TimedOut => Err(StepOutcome::Failed(step_error(
                step_id,
                format!("timed out after {}s", self.config.step_timeout_secs),
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions & persistence
    // -----------------------------------------------------------------------

    async fn complete(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        instance.status = WorkflowStatus::Completed;
        instance.current_step_id = None;
        instance.final_output = final_output(definition, &instance.context);
        if !self.persist(instance, token).await? {
            return Ok(());
        }

        self.event_bus.publish(EngineEvent::WorkflowCompleted {
            instance_id: instance.id,
            final_output: instance.final_output.clone(),
        });
        tracing::info!(
            instance_id = %instance.id,
            definition_id = instance.definition_id.as_str(),
            steps = instance.context.step_history.len(),
            "workflow completed"
        );
        Ok(())
    }

    async fn fail(
        &self,
        instance: &mut WorkflowInstance,
        step_id: Option<&str>,
        error: String,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        if let Some(step_id) = step_id {
            let state = instance.context.step_state_mut(step_id);
            state.status = StepStatus::Failed;
            state.error = Some(error.clone());
            state.completed_at = Some(Utc::now());
        }
        instance.status = WorkflowStatus::Failed;
        instance.current_step_id = None;
        instance.checkpoint_deadline = None;
        instance.error = Some(error.clone());
        if !self.persist(instance, token).await? {
            return Ok(());
        }

        if let Some(step_id) = step_id {
            self.event_bus.publish(EngineEvent::StepFailed {
                instance_id: instance.id,
                step_id: step_id.to_string(),
                error: error.clone(),
            });
        }
        self.event_bus.publish(EngineEvent::WorkflowFailed {
            instance_id: instance.id,
            error: error.clone(),
        });
        tracing::warn!(instance_id = %instance.id, error = error.as_str(), "workflow failed");
        Ok(())
    }

    /// Save unless the advance has been cancelled. Returns whether it saved.
    async fn persist(
        &self,
        instance: &mut WorkflowInstance,
        token: &CancellationToken,
    ) -> Result<bool, EngineError> {
        if token.is_cancelled() {
            return Ok(false);
        }
        self.save(instance).await?;
        Ok(true)
    }

    async fn save(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        instance.touch();
        self.repo.save(instance).await?;
        Ok(())
    }
}

fn waiting_checkpoint<'a>(
    definition: &'a WorkflowDefinition,
    instance: &WorkflowInstance,
) -> Result<WaitingCheckpoint<'a>, EngineError> {
    let step_id = instance.current_step_id.as_deref().unwrap_or_default();
    let unknown = || EngineError::UnknownStepReference {
        reference: step_id.to_string(),
        origin: "waiting checkpoint".to_string(),
    };
    let step = definition.get_step(step_id).ok_or_else(unknown)?;
    match &step.config {
        StepConfig::Checkpoint {
            checkpoint,
            next_step_id,
            reject_step_id,
        } => Ok(WaitingCheckpoint {
            step,
            config: checkpoint,
            next_step_id: next_step_id.as_deref(),
            reject_step_id: reject_step_id.as_deref(),
        }),
        _ => Err(unknown()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use stepwise_types::workflow::StepOutput;
    use tokio::sync::Notify;

    use crate::behavior::{branch_fn, predicate_fn, step_fn, StepBehavior};
    use crate::repository::InMemoryInstanceRepository;

    // -- fixtures -----------------------------------------------------------

    fn step(id: &str, config: StepConfig) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            ui_component: None,
            config,
        }
    }

    fn execute(id: &str, behavior: &str, next: Option<&str>) -> StepDefinition {
        step(
            id,
            StepConfig::Execute {
                behavior: behavior.to_string(),
                next_step_id: next.map(String::from),
            },
        )
    }

    fn checkpoint_step(
        id: &str,
        actions: Vec<CheckpointAction>,
        next: Option<&str>,
        reject: Option<&str>,
    ) -> StepDefinition {
        step(
            id,
            StepConfig::Checkpoint {
                checkpoint: CheckpointConfig {
                    title: format!("{id} title"),
                    description: String::new(),
                    allowed_actions: actions,
                    editable_fields: vec!["x".to_string()],
                    auto_proceed: false,
                    auto_proceed_timeout_secs: None,
                },
                next_step_id: next.map(String::from),
                reject_step_id: reject.map(String::from),
            },
        )
    }

    fn definition(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            category: "test".to_string(),
            icon: None,
            initial_step_id: steps[0].id.clone(),
            steps,
            input_schema: Value::Null,
            output_schema: Value::Null,
            final_output: FinalOutputPolicy::LastStep,
        }
    }

    fn standard_actions() -> Vec<CheckpointAction> {
        vec![
            CheckpointAction::Approve,
            CheckpointAction::Edit,
            CheckpointAction::Reject,
        ]
    }

    /// collect(execute) -> review(checkpoint) -> finish(execute) -> end
    fn review_definition() -> WorkflowDefinition {
        definition(
            "review",
            vec![
                execute("collect", "collect", Some("review")),
                checkpoint_step("review", standard_actions(), Some("finish"), None),
                execute("finish", "finish", None),
            ],
        )
    }

    fn behaviors() -> BehaviorRegistry {
        let mut behaviors = BehaviorRegistry::new();
        behaviors.register_step(
            "collect",
            step_fn(|ctx| {
                let topic = ctx.input_field("topic").cloned().unwrap_or(Value::Null);
                Ok(StepOutput::success(json!({ "collected": topic })))
            }),
        );
        behaviors.register_step(
            "finish",
            step_fn(|ctx| {
                let x = ctx.get_user_edit("x").cloned().unwrap_or(json!("default"));
                Ok(StepOutput::success(json!({ "x": x })))
            }),
        );
        behaviors.register_step(
            "boom",
            step_fn(|_| Ok(StepOutput::failure("exploded"))),
        );
        behaviors.register_step(
            "body",
            step_fn(|ctx| {
                let n = ctx.increment_counter("body_runs");
                Ok(StepOutput::success(json!({ "run": n })))
            }),
        );
        behaviors.register_predicate(
            "twice",
            predicate_fn(|ctx| Ok(ctx.increment_counter("checks") <= 2)),
        );
        behaviors.register_predicate("forever", predicate_fn(|_| Ok(true)));
        behaviors.register_branch("ghost", branch_fn(|_| Ok("ghost".to_string())));
        behaviors.register_branch(
            "by-flag",
            branch_fn(|ctx| {
                Ok(if ctx.input_field("fast") == Some(&json!(true)) {
                    "finish".to_string()
                } else {
                    "collect".to_string()
                })
            }),
        );
        behaviors
    }

    fn engine_with(
        definitions: Vec<WorkflowDefinition>,
        behaviors: BehaviorRegistry,
        repo: InMemoryInstanceRepository,
        config: EngineConfig,
    ) -> WorkflowEngine<InMemoryInstanceRepository> {
        let mut registry = WorkflowRegistry::new();
        for def in definitions {
            registry.register(def).unwrap();
        }
        WorkflowEngine::new(
            Arc::new(registry),
            Arc::new(behaviors),
            repo,
            EventBus::new(256),
            config,
        )
    }

    fn engine(definitions: Vec<WorkflowDefinition>) -> WorkflowEngine<InMemoryInstanceRepository> {
        engine_with(
            definitions,
            behaviors(),
            InMemoryInstanceRepository::new(),
            EngineConfig::default(),
        )
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    // -- scenario A: approve --------------------------------------------------

    #[tokio::test]
    async fn advance_stops_at_checkpoint_then_approve_completes() {
        let engine = engine(vec![review_definition()]);
        let mut rx = engine.event_bus().subscribe();

        let instance = engine
            .start("review", json!({"topic": "rust"}), None)
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Waiting);
        assert_eq!(instance.current_step_id.as_deref(), Some("review"));
        assert_eq!(
            instance.context.get_step_output("collect"),
            Some(&json!({"collected": "rust"}))
        );
        assert_eq!(
            instance.context.step_state("review").unwrap().status,
            StepStatus::Completed
        );
        assert!(instance.checkpoint_deadline.is_none());
        assert_eq!(
            drain(&mut rx),
            vec!["step_started", "step_completed", "step_started", "checkpoint_reached"]
        );

        let done = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Approve, HashMap::new())
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.current_step_id.is_none());
        assert!(done.completed_at.is_some());
        assert_eq!(done.final_output, Some(json!({"x": "default"})));
        assert_eq!(done.context.step_history, vec!["collect", "review", "finish"]);
        assert_eq!(
            drain(&mut rx),
            vec![
                "checkpoint_resolved",
                "step_started",
                "step_completed",
                "workflow_completed"
            ]
        );

        let stored = engine.get_instance(instance.id).await.unwrap();
        assert_eq!(stored, done);
    }

    // -- scenario B: edit -----------------------------------------------------

    #[tokio::test]
    async fn edit_merges_user_edits_then_proceeds() {
        let engine = engine(vec![review_definition()]);
        let instance = engine.start("review", json!({}), None).await.unwrap();

        let edits = HashMap::from([("x".to_string(), json!("y"))]);
        let done = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Edit, edits)
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.context.get_user_edit("x"), Some(&json!("y")));
        assert_eq!(done.final_output, Some(json!({"x": "y"})));
    }

    #[tokio::test]
    async fn edit_of_non_editable_field_is_rejected_without_mutation() {
        let engine = engine(vec![review_definition()]);
        let instance = engine.start("review", json!({}), None).await.unwrap();

        let edits = HashMap::from([("secret".to_string(), json!(1))]);
        let err = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Edit, edits)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEditableField { ref field, .. } if field == "secret"));

        let stored = engine.get_instance(instance.id).await.unwrap();
        assert_eq!(stored, instance);
    }

    #[tokio::test]
    async fn disallowed_action_is_rejected() {
        let engine = engine(vec![review_definition()]);
        let instance = engine.start("review", json!({}), None).await.unwrap();

        let err = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Skip, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidCheckpointAction {
                action: CheckpointAction::Skip,
                ..
            }
        ));
        assert_eq!(
            engine.get_instance(instance.id).await.unwrap().status,
            WorkflowStatus::Waiting
        );
    }

    // -- reject & skip --------------------------------------------------------

    #[tokio::test]
    async fn reject_without_target_cancels() {
        let engine = engine(vec![review_definition()]);
        let instance = engine.start("review", json!({}), None).await.unwrap();

        let rejected = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Reject, HashMap::new())
            .await
            .unwrap();
        assert_eq!(rejected.status, WorkflowStatus::Cancelled);
        assert!(rejected.current_step_id.is_none());
        assert!(rejected.context.get_step_output("finish").is_none());
    }

    #[tokio::test]
    async fn reject_with_target_loops_back() {
        let def = definition(
            "redo",
            vec![
                execute("collect", "body", Some("review")),
                checkpoint_step("review", standard_actions(), Some("finish"), Some("collect")),
                execute("finish", "finish", None),
            ],
        );
        let engine = engine(vec![def]);
        let instance = engine.start("redo", json!({}), None).await.unwrap();

        let again = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Reject, HashMap::new())
            .await
            .unwrap();
        assert_eq!(again.status, WorkflowStatus::Waiting);
        assert_eq!(again.current_step_id.as_deref(), Some("review"));
        assert_eq!(again.context.get_step_output("collect"), Some(&json!({"run": 2})));
    }

    #[tokio::test]
    async fn skip_marks_checkpoint_skipped() {
        let def = definition(
            "skippable",
            vec![
                checkpoint_step(
                    "gate",
                    vec![CheckpointAction::Approve, CheckpointAction::Skip],
                    Some("finish"),
                    None,
                ),
                execute("finish", "finish", None),
            ],
        );
        let engine = engine(vec![def]);
        let instance = engine.start("skippable", json!({}), None).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Waiting);

        let done = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Skip, HashMap::new())
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(
            done.context.step_state("gate").unwrap().status,
            StepStatus::Skipped
        );
    }

    #[tokio::test]
    async fn approving_final_checkpoint_completes() {
        let def = definition(
            "last-gate",
            vec![
                execute("collect", "collect", Some("gate")),
                checkpoint_step("gate", standard_actions(), None, None),
            ],
        );
        let engine = engine(vec![def]);
        let instance = engine.start("last-gate", json!({"topic": 1}), None).await.unwrap();
        let done = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Approve, HashMap::new())
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.final_output, Some(json!({"collected": 1})));
    }

    // -- scenario C: bad branch ----------------------------------------------

    #[tokio::test]
    async fn branch_to_unknown_step_fails_instance() {
        let def = definition(
            "branchy",
            vec![
                step(
                    "route",
                    StepConfig::Conditional {
                        behavior: "ghost".to_string(),
                    },
                ),
                execute("finish", "finish", None),
            ],
        );
        let engine = engine(vec![def]);
        let mut rx = engine.event_bus().subscribe();

        let failed = engine.start("branchy", json!({}), None).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        let error = failed.error.clone().unwrap();
        assert!(error.contains("unknown step 'ghost'"), "got: {error}");
        let state = failed.context.step_state("route").unwrap();
        assert_eq!(state.status, StepStatus::Failed);
        assert!(failed.context.step_data.is_empty());
        assert_eq!(
            drain(&mut rx),
            vec!["step_started", "step_failed", "workflow_failed"]
        );
    }

    #[tokio::test]
    async fn branch_selects_next_step() {
        let def = definition(
            "branchy",
            vec![
                step(
                    "route",
                    StepConfig::Conditional {
                        behavior: "by-flag".to_string(),
                    },
                ),
                execute("collect", "collect", None),
                execute("finish", "finish", None),
            ],
        );
        let engine = engine(vec![def]);

        let fast = engine.start("branchy", json!({"fast": true}), None).await.unwrap();
        assert_eq!(fast.status, WorkflowStatus::Completed);
        assert_eq!(fast.context.step_history, vec!["route", "finish"]);
        assert!(fast.context.get_step_output("route").is_none());

        let slow = engine.start("branchy", json!({}), None).await.unwrap();
        assert_eq!(slow.context.step_history, vec!["route", "collect"]);
    }

    // -- scenario D: loop -----------------------------------------------------

    fn loop_definition(predicate: &str, max_iterations: Option<u32>) -> WorkflowDefinition {
        definition(
            "loopy",
            vec![
                execute("body", "body", Some("again")),
                step(
                    "again",
                    StepConfig::Loop {
                        predicate: predicate.to_string(),
                        loop_step_id: "body".to_string(),
                        next_step_id: Some("finish".to_string()),
                        max_iterations,
                    },
                ),
                execute("finish", "finish", None),
            ],
        )
    }

    #[tokio::test]
    async fn loop_runs_until_predicate_is_false() {
        let engine = engine(vec![loop_definition("twice", None)]);
        let done = engine.start("loopy", json!({}), None).await.unwrap();

        assert_eq!(done.status, WorkflowStatus::Completed);
        let loop_state = done.context.step_state("again").unwrap();
        assert_eq!(loop_state.execution_count, 2);
        assert_eq!(loop_state.status, StepStatus::Completed);
        assert_eq!(done.context.step_state("body").unwrap().execution_count, 0);
        // Later iterations overwrite earlier output.
        assert_eq!(done.context.get_step_output("body"), Some(&json!({"run": 3})));
        assert_eq!(
            done.context.step_history,
            vec!["body", "again", "body", "again", "body", "again", "finish"]
        );
    }

    #[tokio::test]
    async fn loop_stops_at_max_iterations() {
        let engine = engine(vec![loop_definition("forever", Some(3))]);
        let done = engine.start("loopy", json!({}), None).await.unwrap();

        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.context.step_state("again").unwrap().execution_count, 3);
        assert_eq!(done.context.counter("body_runs"), 4);
    }

    #[tokio::test]
    async fn runaway_loop_hits_step_budget() {
        let config = EngineConfig {
            max_steps_per_advance: 10,
            ..EngineConfig::default()
        };
        let engine = engine_with(
            vec![loop_definition("forever", None)],
            behaviors(),
            InMemoryInstanceRepository::new(),
            config,
        );
        let failed = engine.start("loopy", json!({}), None).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.error.unwrap().contains("exceeded 10 steps"));
    }

    // -- scenario E: cancel while waiting ---------------------------------------

    #[tokio::test]
    async fn cancel_while_waiting_blocks_resolution() {
        let engine = engine(vec![review_definition()]);
        let instance = engine.start("review", json!({}), None).await.unwrap();

        let cancelled = engine.cancel(instance.id).await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
        assert!(cancelled.current_step_id.is_none());

        let err = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Approve, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition {
                status: WorkflowStatus::Cancelled,
                ..
            }
        ));

        let err = engine.cancel(instance.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    // -- failures ---------------------------------------------------------------

    #[tokio::test]
    async fn failed_output_fails_instance() {
        let def = definition(
            "explodes",
            vec![
                execute("blow", "boom", Some("finish")),
                execute("finish", "finish", None),
            ],
        );
        let engine = engine(vec![def]);
        let mut rx = engine.event_bus().subscribe();

        let failed = engine.start("explodes", json!({}), None).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.current_step_id.is_none());
        assert_eq!(
            failed.error.as_deref(),
            Some("step 'blow' failed: exploded")
        );
        let state = failed.context.step_state("blow").unwrap();
        assert_eq!(state.status, StepStatus::Failed);
        assert!(state.output.as_ref().is_some_and(|o| !o.success));
        assert!(failed.context.step_state("finish").is_none());
        assert_eq!(
            drain(&mut rx),
            vec!["step_started", "step_failed", "workflow_failed"]
        );

        let err = engine.advance(failed.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn unbound_behavior_fails_instance() {
        let def = definition("unbound", vec![execute("a", "not-registered", None)]);
        let engine = engine(vec![def]);
        let failed = engine.start("unbound", json!({}), None).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.error.unwrap().contains("no behavior bound to 'not-registered'"));
    }

    #[tokio::test]
    async fn unknown_ids_are_caller_errors() {
        let engine = engine(vec![review_definition()]);
        assert!(matches!(
            engine.start("nope", json!({}), None).await,
            Err(EngineError::DefinitionNotFound(_))
        ));
        assert!(matches!(
            engine.advance(Uuid::now_v7()).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    struct Sleeper;

    impl StepBehavior for Sleeper {
        async fn execute(&self, _call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StepOutput::success(Value::Null))
        }
    }

    #[tokio::test]
    async fn slow_behavior_times_out() {
        let mut behaviors = behaviors();
        behaviors.register_step("sleep", Sleeper);
        let config = EngineConfig {
            step_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let def = definition("slow", vec![execute("nap", "sleep", None)]);
        let engine = engine_with(vec![def], behaviors, InMemoryInstanceRepository::new(), config);

        let failed = engine.start("slow", json!({}), None).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.error.unwrap().contains("timed out after 1s"));
    }

    // -- progress ---------------------------------------------------------------

    struct Chatty;

    impl StepBehavior for Chatty {
        async fn execute(&self, call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
            call.report("halfway");
            call.report("done");
            Ok(StepOutput::success(json!({"chatty": true})))
        }
    }

    #[tokio::test]
    async fn progress_is_forwarded_before_completion() {
        let mut behaviors = behaviors();
        behaviors.register_step("chatty", Chatty);
        let def = definition("talk", vec![execute("talk", "chatty", None)]);
        let engine = engine_with(
            vec![def],
            behaviors,
            InMemoryInstanceRepository::new(),
            EngineConfig::default(),
        );
        let mut rx = engine.event_bus().subscribe();

        engine.start("talk", json!({}), None).await.unwrap();

        let mut messages = Vec::new();
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
            if let EngineEvent::StepProgress { message, .. } = event {
                messages.push(message);
            }
        }
        assert_eq!(messages, vec!["halfway", "done"]);
        assert_eq!(
            kinds,
            vec![
                "step_started",
                "step_progress",
                "step_progress",
                "step_completed",
                "workflow_completed"
            ]
        );
    }

    // -- cancellation in flight ---------------------------------------------------

    struct Blocking {
        started: Arc<Notify>,
    }

    impl StepBehavior for Blocking {
        async fn execute(&self, call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
            self.started.notify_one();
            call.cancel.cancelled().await;
            Err(BehaviorError::Cancelled)
        }
    }

    #[tokio::test]
    async fn cancel_during_advance_stops_at_step_boundary() {
        let started = Arc::new(Notify::new());
        let mut behaviors = behaviors();
        behaviors.register_step(
            "block",
            Blocking {
                started: started.clone(),
            },
        );
        let def = definition(
            "blocked",
            vec![
                execute("wait", "block", Some("finish")),
                execute("finish", "finish", None),
            ],
        );
        let engine = Arc::new(engine_with(
            vec![def],
            behaviors,
            InMemoryInstanceRepository::new(),
            EngineConfig::default(),
        ));

        let instance = engine.create_instance("blocked", json!({}), None).await.unwrap();
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.advance(instance.id).await })
        };

        started.notified().await;
        let cancelled = engine.cancel(instance.id).await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

        let finished = runner.await.unwrap().unwrap();
        assert_eq!(finished.status, WorkflowStatus::Cancelled);
        assert!(finished.context.step_state("finish").is_none());

        let stored = engine.get_instance(instance.id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
    }

    struct Graceful {
        started: Arc<Notify>,
        cleaned_up: Arc<std::sync::atomic::AtomicBool>,
    }

    impl StepBehavior for Graceful {
        async fn execute(&self, call: StepCall<'_>) -> Result<StepOutput, BehaviorError> {
            self.started.notify_one();
            call.cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.cleaned_up
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(StepOutput::success(json!({"partial": true})))
        }
    }

    #[tokio::test]
    async fn cancelled_behavior_runs_to_its_own_end() {
        let started = Arc::new(Notify::new());
        let cleaned_up = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut behaviors = behaviors();
        behaviors.register_step(
            "graceful",
            Graceful {
                started: started.clone(),
                cleaned_up: cleaned_up.clone(),
            },
        );
        let def = definition(
            "graceful",
            vec![
                execute("work", "graceful", Some("finish")),
                execute("finish", "finish", None),
            ],
        );
        let engine = Arc::new(engine_with(
            vec![def],
            behaviors,
            InMemoryInstanceRepository::new(),
            EngineConfig::default(),
        ));

        let instance = engine.create_instance("graceful", json!({}), None).await.unwrap();
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.advance(instance.id).await })
        };

        started.notified().await;
        engine.cancel(instance.id).await.unwrap();

        let finished = runner.await.unwrap().unwrap();
        assert!(cleaned_up.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(finished.status, WorkflowStatus::Cancelled);
        assert!(!finished.context.step_data.contains_key("work"));
        assert!(finished.context.step_state("finish").is_none());
    }

    // -- pause / resume -------------------------------------------------------------

    #[tokio::test]
    async fn pause_then_resume_runs_to_completion() {
        let engine = engine(vec![review_definition()]);
        let mut rx = engine.event_bus().subscribe();
        let instance = engine
            .create_instance("review", json!({"topic": "t"}), Some("chat-1".into()))
            .await
            .unwrap();

        let paused = engine.pause(instance.id).await.unwrap();
        assert_eq!(paused.status, WorkflowStatus::Paused);
        assert!(matches!(
            engine.advance(instance.id).await,
            Err(EngineError::InvalidStateTransition { .. })
        ));

        let resumed = engine.resume(instance.id).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Waiting);
        assert_eq!(resumed.correlation_id.as_deref(), Some("chat-1"));
        assert_eq!(drain(&mut rx)[0], "workflow_paused");

        assert!(matches!(
            engine.pause(instance.id).await,
            Err(EngineError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            engine.resume(instance.id).await,
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    // -- auto-proceed -----------------------------------------------------------------

    fn auto_definition() -> WorkflowDefinition {
        let mut gate = checkpoint_step("gate", standard_actions(), Some("finish"), None);
        if let StepConfig::Checkpoint { checkpoint, .. } = &mut gate.config {
            checkpoint.auto_proceed = true;
            checkpoint.auto_proceed_timeout_secs = Some(60);
        }
        definition("auto", vec![gate, execute("finish", "finish", None)])
    }

    #[tokio::test]
    async fn auto_proceed_respects_deadline() {
        let engine = engine(vec![auto_definition(), review_definition()]);
        let instance = engine.start("auto", json!({}), None).await.unwrap();
        let deadline = instance.checkpoint_deadline.unwrap();
        assert!(deadline > Utc::now() + TimeDelta::seconds(50));

        let early = engine.auto_proceed(instance.id, Utc::now()).await.unwrap();
        assert!(early.is_none());

        let done = engine
            .auto_proceed(instance.id, deadline + TimeDelta::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.checkpoint_deadline.is_none());

        let manual = engine.start("review", json!({}), None).await.unwrap();
        let none = engine
            .auto_proceed(manual.id, Utc::now() + TimeDelta::days(365))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    // -- persistence ------------------------------------------------------------------

    #[tokio::test]
    async fn reload_mid_execution_matches_continuous_run() {
        let def = definition(
            "long",
            vec![
                execute("collect", "collect", Some("review")),
                checkpoint_step("review", standard_actions(), Some("body"), None),
                execute("body", "body", Some("again")),
                step(
                    "again",
                    StepConfig::Loop {
                        predicate: "twice".to_string(),
                        loop_step_id: "body".to_string(),
                        next_step_id: Some("finish".to_string()),
                        max_iterations: None,
                    },
                ),
                execute("finish", "finish", None),
            ],
        );

        // Continuous: one engine does everything.
        let continuous_engine = engine(vec![def.clone()]);
        let first = continuous_engine.start("long", json!({"topic": "a"}), None).await.unwrap();
        let continuous = continuous_engine
            .resolve_checkpoint(first.id, CheckpointAction::Approve, HashMap::new())
            .await
            .unwrap();

        // Interrupted: a second engine picks the instance up from storage.
        let repo = InMemoryInstanceRepository::new();
        let before = engine_with(vec![def.clone()], behaviors(), repo.clone(), EngineConfig::default());
        let waiting = before.start("long", json!({"topic": "a"}), None).await.unwrap();
        drop(before);

        let json = serde_json::to_string(&repo.get(&waiting.id).await.unwrap().unwrap()).unwrap();
        let reloaded: WorkflowInstance = serde_json::from_str(&json).unwrap();
        repo.save(&reloaded).await.unwrap();

        let after = engine_with(vec![def], behaviors(), repo, EngineConfig::default());
        let resumed = after
            .resolve_checkpoint(waiting.id, CheckpointAction::Approve, HashMap::new())
            .await
            .unwrap();

        assert_eq!(resumed.status, continuous.status);
        assert_eq!(resumed.context.step_history, continuous.context.step_history);
        assert_eq!(resumed.context.step_data, continuous.context.step_data);
        assert_eq!(resumed.final_output, continuous.final_output);
    }

    #[tokio::test]
    async fn resolving_twice_does_not_double_apply() {
        let engine = engine(vec![review_definition()]);
        let instance = engine.start("review", json!({}), None).await.unwrap();

        let edits = HashMap::from([("x".to_string(), json!("first"))]);
        let done = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Edit, edits)
            .await
            .unwrap();

        let again = HashMap::from([("x".to_string(), json!("second"))]);
        let err = engine
            .resolve_checkpoint(instance.id, CheckpointAction::Edit, again)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

        let stored = engine.get_instance(instance.id).await.unwrap();
        assert_eq!(stored.context.get_user_edit("x"), Some(&json!("first")));
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn interrupted_running_instance_reexecutes_current_step() {
        let repo = InMemoryInstanceRepository::new();
        let engine = engine_with(
            vec![review_definition()],
            behaviors(),
            repo.clone(),
            EngineConfig::default(),
        );
        let mut instance = engine.create_instance("review", json!({"topic": "z"}), None).await.unwrap();
        // Simulate a crash right after the step was marked running.
        instance.status = WorkflowStatus::Running;
        instance.context.step_state_mut("collect").status = StepStatus::Running;
        repo.save(&instance).await.unwrap();

        let resumed = engine.advance(instance.id).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Waiting);
        assert_eq!(
            resumed.context.step_state("collect").unwrap().status,
            StepStatus::Completed
        );
    }

    // -- final output policies ----------------------------------------------------------

    #[tokio::test]
    async fn final_output_policies() {
        let mut all = definition(
            "all",
            vec![
                execute("collect", "collect", Some("finish")),
                execute("finish", "finish", None),
            ],
        );
        all.final_output = FinalOutputPolicy::AllSteps;
        let mut pick = all.clone();
        pick.id = "pick".to_string();
        pick.final_output = FinalOutputPolicy::Step {
            step_id: "collect".to_string(),
        };
        let mut nothing = all.clone();
        nothing.id = "nothing".to_string();
        nothing.final_output = FinalOutputPolicy::None;

        let engine = engine(vec![all, pick, nothing]);

        let out = engine.start("all", json!({"topic": 7}), None).await.unwrap();
        assert_eq!(
            out.final_output,
            Some(json!({"collect": {"collected": 7}, "finish": {"x": "default"}}))
        );
        let out = engine.start("pick", json!({"topic": 7}), None).await.unwrap();
        assert_eq!(out.final_output, Some(json!({"collected": 7})));
        let out = engine.start("nothing", json!({"topic": 7}), None).await.unwrap();
        assert_eq!(out.status, WorkflowStatus::Completed);
        assert!(out.final_output.is_none());
    }

    #[test]
    fn last_step_policy_ignores_non_execute_steps() {
        let def = loop_definition("twice", None);
        let mut ctx = WorkflowContext::new(Uuid::nil(), "loopy".into(), json!({}));
        ctx.step_data.insert("body".into(), json!(1));
        ctx.step_history = vec!["body".into(), "again".into()];
        assert_eq!(final_output(&def, &ctx), Some(json!(1)));
    }
}
