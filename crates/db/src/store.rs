//! The narrow persistence interface used by the lifecycle layer.
//!
//! Four operations per record kind: get, save, mark-deleted, and (for
//! jobs) set-state. Implementations: [`InMemoryStore`](crate::memory::InMemoryStore)
//! and [`PgStore`](crate::pg::PgStore).

use async_trait::async_trait;
use ocrd_core::job::JobState;

use crate::error::DbError;
use crate::models::{WorkflowJobRecord, WorkflowRecord, WorkspaceRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, DbError>;

    /// Insert or replace the record for `record.id`. The tombstone flag of
    /// an existing row is never cleared.
    async fn save_workspace(&self, record: &WorkspaceRecord) -> Result<WorkspaceRecord, DbError>;

    /// Set the tombstone. Returns `false` when no record exists.
    async fn mark_workspace_deleted(&self, id: &str) -> Result<bool, DbError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, DbError>;

    /// Same tombstone rule as [`save_workspace`](Self::save_workspace).
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<WorkflowRecord, DbError>;

    async fn mark_workflow_deleted(&self, id: &str) -> Result<bool, DbError>;

    async fn get_job(&self, id: &str) -> Result<Option<WorkflowJobRecord>, DbError>;

    async fn save_job(&self, record: &WorkflowJobRecord) -> Result<WorkflowJobRecord, DbError>;

    /// Move a job to `next` if that is a legal forward transition from its
    /// current state. Returns whether the state changed.
    async fn set_job_state(&self, id: &str, next: JobState) -> Result<bool, DbError>;
}

/// `true` when the record exists and carries the tombstone.
pub async fn is_workspace_tombstoned(store: &dyn RecordStore, id: &str) -> Result<bool, DbError> {
    Ok(store.get_workspace(id).await?.is_some_and(|r| r.deleted))
}

/// `true` when the record exists and carries the tombstone.
pub async fn is_workflow_tombstoned(store: &dyn RecordStore, id: &str) -> Result<bool, DbError> {
    Ok(store.get_workflow(id).await?.is_some_and(|r| r.deleted))
}
