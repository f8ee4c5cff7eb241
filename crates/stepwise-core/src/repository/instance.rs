//! Workflow instance repository trait definition.
//!
//! The engine needs only load-by-id and save; listing and deletion serve the
//! checkpoint sweeper and operator tooling. The infrastructure layer
//! (stepwise-infra) implements this trait with SQLite persistence.

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

/// Repository trait for workflow instance persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceRepository: Send + Sync {
    /// Get an instance by its UUID.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Upsert an instance (insert or replace by ID).
    fn save(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List instances, newest first, optionally filtered by status.
    fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Waiting instances whose checkpoint deadline is at or before `now`,
    /// earliest deadline first.
    fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Delete an instance by ID. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
