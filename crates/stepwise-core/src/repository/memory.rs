//! In-process instance repository.
//!
//! Backs engine tests and embedded use where durability is not required.
//! Cloning shares the underlying map, so two engines built over clones of the
//! same repository see each other's writes (useful for reload tests).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

use super::instance::InstanceRepository;

/// `InstanceRepository` over a shared `DashMap`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInstanceRepository {
    instances: Arc<DashMap<Uuid, WorkflowInstance>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl InstanceRepository for InMemoryInstanceRepository {
    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| status.is_none_or(|s| entry.value().status == s))
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        instances.truncate(limit as usize);
        Ok(instances)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut due: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| {
                let i = entry.value();
                i.status == WorkflowStatus::Waiting
                    && i.checkpoint_deadline.is_some_and(|d| d <= now)
            })
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by(|a, b| {
            a.checkpoint_deadline
                .cmp(&b.checkpoint_deadline)
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.instances.remove(id).is_some())
    }
}
