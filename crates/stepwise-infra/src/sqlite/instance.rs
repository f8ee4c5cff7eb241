//! SQLite workflow instance repository.
//!
//! Implements `InstanceRepository` from `stepwise-core`. Scalar fields get
//! their own columns for filtering; the execution context and final output
//! are stored as JSON blobs. Timestamps are fixed-width RFC 3339 strings so
//! they sort lexicographically.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepwise_core::repository::InstanceRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{WorkflowContext, WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

const COLUMNS: &str = "id, definition_id, status, current_step_id, correlation_id, context, \
                       final_output, error, checkpoint_deadline, created_at, updated_at, completed_at";

/// SQLite-backed implementation of `InstanceRepository`.
#[derive(Clone)]
pub struct SqliteInstanceRepository {
    pool: DatabasePool,
}

impl SqliteInstanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    definition_id: String,
    status: String,
    current_step_id: Option<String>,
    correlation_id: Option<String>,
    context: String,
    final_output: Option<String>,
    error: Option<String>,
    checkpoint_deadline: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            status: row.try_get("status")?,
            current_step_id: row.try_get("current_step_id")?,
            correlation_id: row.try_get("correlation_id")?,
            context: row.try_get("context")?,
            final_output: row.try_get("final_output")?,
            error: row.try_get("error")?,
            checkpoint_deadline: row.try_get("checkpoint_deadline")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: WorkflowStatus = self
            .status
            .parse()
            .map_err(RepositoryError::Query)?;
        let context: WorkflowContext = serde_json::from_str(&self.context)?;
        let final_output = self
            .final_output
            .as_deref()
            .map(|s| serde_json::from_str(s))
            .transpose()?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: self.definition_id,
            status,
            context,
            current_step_id: self.current_step_id,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            correlation_id: self.correlation_id,
            final_output,
            error: self.error,
            checkpoint_deadline: self
                .checkpoint_deadline
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// InstanceRepository impl
// ---------------------------------------------------------------------------

impl InstanceRepository for SqliteInstanceRepository {
    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM workflow_instances WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let context = serde_json::to_string(&instance.context)?;
        let final_output = instance
            .final_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(&format!(
            r#"INSERT INTO workflow_instances ({COLUMNS})
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 current_step_id = excluded.current_step_id,
                 correlation_id = excluded.correlation_id,
                 context = excluded.context,
                 final_output = excluded.final_output,
                 error = excluded.error,
                 checkpoint_deadline = excluded.checkpoint_deadline,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#
        ))
        .bind(instance.id.to_string())
        .bind(&instance.definition_id)
        .bind(instance.status.as_str())
        .bind(&instance.current_step_id)
        .bind(&instance.correlation_id)
        .bind(&context)
        .bind(&final_output)
        .bind(&instance.error)
        .bind(instance.checkpoint_deadline.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::trace!(instance_id = %instance.id, status = %instance.status, "instance saved");
        Ok(())
    }

    async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM workflow_instances WHERE status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM workflow_instances \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_error)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflow_instances \
             WHERE status = ? AND checkpoint_deadline IS NOT NULL AND checkpoint_deadline <= ? \
             ORDER BY checkpoint_deadline ASC, id ASC LIMIT ?"
        ))
        .bind(WorkflowStatus::Waiting.as_str())
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_error)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::instance::{ContextValue, StepStatus};
    use stepwise_types::workflow::StepOutput;

    async fn repo() -> (SqliteInstanceRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteInstanceRepository::new(pool), dir)
    }

    fn instance(definition_id: &str) -> WorkflowInstance {
        let id = Uuid::now_v7();
        let now = Utc::now();
        WorkflowInstance {
            id,
            definition_id: definition_id.to_string(),
            status: WorkflowStatus::Pending,
            context: WorkflowContext::new(id, definition_id.to_string(), json!({"topic": "x"})),
            current_step_id: Some("first".to_string()),
            created_at: now,
            updated_at: now,
            completed_at: None,
            correlation_id: None,
            final_output: None,
            error: None,
            checkpoint_deadline: None,
        }
    }

    #[tokio::test]
    async fn save_and_get_preserve_every_field() {
        let (repo, _dir) = repo().await;
        let mut inst = instance("wf");
        inst.status = WorkflowStatus::Waiting;
        inst.correlation_id = Some("conv-7".to_string());
        inst.checkpoint_deadline = Some(Utc::now());
        inst.context.step_data.insert("first".into(), json!({"n": 1}));
        inst.context.user_edits.insert("title".into(), json!("edited"));
        inst.context.set_variable("approved", ContextValue::Flag(true));
        inst.context.step_history.push("first".into());
        let state = inst.context.step_state_mut("first");
        state.status = StepStatus::Completed;
        state.output = Some(StepOutput::success(json!({"n": 1})));

        repo.save(&inst).await.unwrap();
        let loaded = repo.get(&inst.id).await.unwrap().unwrap();
        assert_eq!(loaded, inst);
    }

    #[tokio::test]
    async fn save_upserts() {
        let (repo, _dir) = repo().await;
        let mut inst = instance("wf");
        repo.save(&inst).await.unwrap();

        inst.status = WorkflowStatus::Completed;
        inst.current_step_id = None;
        inst.final_output = Some(json!({"done": true}));
        inst.completed_at = Some(Utc::now());
        repo.save(&inst).await.unwrap();

        let loaded = repo.get(&inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
        assert_eq!(loaded.final_output, Some(json!({"done": true})));
        assert_eq!(repo.list(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_status_newest_first() {
        let (repo, _dir) = repo().await;
        let a = instance("wf");
        let mut b = instance("wf");
        b.created_at = a.created_at + chrono::TimeDelta::seconds(1);
        let mut c = instance("wf");
        c.status = WorkflowStatus::Waiting;
        for inst in [&a, &b, &c] {
            repo.save(inst).await.unwrap();
        }

        let pending = repo.list(Some(WorkflowStatus::Pending), 10).await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        assert_eq!(repo.list(None, 2).await.unwrap().len(), 2);
        let waiting = repo.list(Some(WorkflowStatus::Waiting), 10).await.unwrap();
        assert_eq!(waiting[0].id, c.id);
    }

    #[tokio::test]
    async fn list_due_uses_deadline_not_recency() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();

        let mut overdue = instance("timed");
        overdue.status = WorkflowStatus::Waiting;
        overdue.checkpoint_deadline = Some(now - chrono::TimeDelta::seconds(30));
        repo.save(&overdue).await.unwrap();

        let mut upcoming = instance("timed");
        upcoming.status = WorkflowStatus::Waiting;
        upcoming.checkpoint_deadline = Some(now + chrono::TimeDelta::seconds(30));
        repo.save(&upcoming).await.unwrap();

        for _ in 0..3 {
            let mut manual = instance("manual");
            manual.status = WorkflowStatus::Waiting;
            manual.created_at = now + chrono::TimeDelta::seconds(5);
            repo.save(&manual).await.unwrap();
        }

        let due = repo.list_due(now, 1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, overdue.id);
        assert!(repo.list_due(now - chrono::TimeDelta::seconds(60), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_missing_and_delete() {
        let (repo, _dir) = repo().await;
        assert!(repo.get(&Uuid::now_v7()).await.unwrap().is_none());

        let inst = instance("wf");
        repo.save(&inst).await.unwrap();
        assert!(repo.delete(&inst.id).await.unwrap());
        assert!(!repo.delete(&inst.id).await.unwrap());
        assert!(repo.get(&inst.id).await.unwrap().is_none());
    }
}
