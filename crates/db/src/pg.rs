//! PostgreSQL-backed [`RecordStore`].

use async_trait::async_trait;
use ocrd_core::job::JobState;

use crate::error::DbError;
use crate::models::{WorkflowJobRecord, WorkflowRecord, WorkspaceRecord};
use crate::repositories::{WorkflowJobRepo, WorkflowRepo, WorkspaceRepo};
use crate::store::RecordStore;
use crate::DbPool;

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, DbError> {
        Ok(WorkspaceRepo::find_by_id(&self.pool, id).await?)
    }

    async fn save_workspace(&self, record: &WorkspaceRecord) -> Result<WorkspaceRecord, DbError> {
        Ok(WorkspaceRepo::upsert(&self.pool, record).await?)
    }

    async fn mark_workspace_deleted(&self, id: &str) -> Result<bool, DbError> {
        Ok(WorkspaceRepo::mark_deleted(&self.pool, id).await?)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, DbError> {
        Ok(WorkflowRepo::find_by_id(&self.pool, id).await?)
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<WorkflowRecord, DbError> {
        Ok(WorkflowRepo::upsert(&self.pool, record).await?)
    }

    async fn mark_workflow_deleted(&self, id: &str) -> Result<bool, DbError> {
        Ok(WorkflowRepo::mark_deleted(&self.pool, id).await?)
    }

    async fn get_job(&self, id: &str) -> Result<Option<WorkflowJobRecord>, DbError> {
        Ok(WorkflowJobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn save_job(&self, record: &WorkflowJobRecord) -> Result<WorkflowJobRecord, DbError> {
        Ok(WorkflowJobRepo::upsert(&self.pool, record).await?)
    }

    async fn set_job_state(&self, id: &str, next: JobState) -> Result<bool, DbError> {
        if WorkflowJobRepo::transition(&self.pool, id, next).await? {
            return Ok(true);
        }
        match WorkflowJobRepo::find_by_id(&self.pool, id).await? {
            Some(job) => {
                tracing::debug!(
                    job_id = id,
                    from = %job.state,
                    to = %next,
                    "Ignoring state transition"
                );
                Ok(false)
            }
            None => Err(DbError::MissingRecord(format!("workflow job {id}"))),
        }
    }
}
