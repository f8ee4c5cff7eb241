//! Auto-proceed sweeper for checkpoints with a deadline.
//!
//! Instances waiting at an `auto_proceed` checkpoint carry a
//! `checkpoint_deadline`. The sweeper periodically lists waiting instances
//! whose deadline has passed, earliest first, and approves them. It takes the
//! per-instance lease without waiting, so an instance a caller is resolving
//! right now is simply picked up on a later tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::InstanceRepository;

use super::engine::WorkflowEngine;
use super::error::EngineError;
use super::lease::InstanceLocks;

const DEFAULT_BATCH_SIZE: u32 = 500;

pub struct CheckpointSweeper<R: InstanceRepository> {
    engine: Arc<WorkflowEngine<R>>,
    locks: InstanceLocks,
    batch_size: u32,
}

impl<R: InstanceRepository> CheckpointSweeper<R> {
    /// Create a sweeper that shares `locks` with other callers of `engine`.
    pub fn new(engine: Arc<WorkflowEngine<R>>, locks: InstanceLocks) -> Self {
        Self {
            engine,
            locks,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Maximum number of due instances handled per sweep.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Auto-proceed every due instance once. Returns the ids that moved.
    ///
    /// A failure on one instance is logged and does not stop the sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let due = self.engine.repo().list_due(now, self.batch_size).await?;

        let mut proceeded = Vec::new();
        for instance in due {
            let Some(lease) = self.locks.try_acquire(instance.id) else {
                tracing::debug!(instance_id = %instance.id, "instance busy, skipping");
                continue;
            };
            match self.engine.auto_proceed(instance.id, now).await {
                Ok(Some(_)) => proceeded.push(instance.id),
                Ok(None) => {}
                // Resolved or cancelled since the listing.
                Err(EngineError::InvalidStateTransition { .. }) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %instance.id, error = %e, "auto-proceed failed");
                }
            }
            drop(lease);
            self.locks.forget(instance.id);
        }

        if !proceeded.is_empty() {
            tracing::info!(count = proceeded.len(), "auto-proceeded checkpoints");
        }
        Ok(proceeded)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "checkpoint sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        tracing::warn!(error = %e, "checkpoint sweep failed");
                    }
                }
            }
        }
        tracing::info!("checkpoint sweeper stopped");
    }
}
