//! In-process [`RecordStore`] used when no database is configured, and by
//! tests.

use std::collections::HashMap;

use async_trait::async_trait;
use ocrd_core::job::JobState;
use tokio::sync::RwLock;

use crate::error::DbError;
use crate::models::{WorkflowJobRecord, WorkflowRecord, WorkspaceRecord};
use crate::store::RecordStore;

#[derive(Default)]
struct Tables {
    workspaces: HashMap<String, WorkspaceRecord>,
    workflows: HashMap<String, WorkflowRecord>,
    jobs: HashMap<String, WorkflowJobRecord>,
}

/// Records kept in memory behind an async `RwLock`. Contents are lost when
/// the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, DbError> {
        Ok(self.tables.read().await.workspaces.get(id).cloned())
    }

    async fn save_workspace(&self, record: &WorkspaceRecord) -> Result<WorkspaceRecord, DbError> {
        let mut tables = self.tables.write().await;
        let mut saved = record.clone();
        if let Some(existing) = tables.workspaces.get(&record.id) {
            saved.deleted |= existing.deleted;
            saved.created_at = existing.created_at;
        }
        saved.updated_at = chrono::Utc::now();
        tables.workspaces.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn mark_workspace_deleted(&self, id: &str) -> Result<bool, DbError> {
        let mut tables = self.tables.write().await;
        Ok(match tables.workspaces.get_mut(id) {
            Some(record) => {
                record.deleted = true;
                record.updated_at = chrono::Utc::now();
                true
            }
            None => false,
        })
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, DbError> {
        Ok(self.tables.read().await.workflows.get(id).cloned())
    }

    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<WorkflowRecord, DbError> {
        let mut tables = self.tables.write().await;
        let mut saved = record.clone();
        if let Some(existing) = tables.workflows.get(&record.id) {
            saved.deleted |= existing.deleted;
            saved.created_at = existing.created_at;
        }
        saved.updated_at = chrono::Utc::now();
        tables.workflows.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn mark_workflow_deleted(&self, id: &str) -> Result<bool, DbError> {
        let mut tables = self.tables.write().await;
        Ok(match tables.workflows.get_mut(id) {
            Some(record) => {
                record.deleted = true;
                record.updated_at = chrono::Utc::now();
                true
            }
            None => false,
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<WorkflowJobRecord>, DbError> {
        Ok(self.tables.read().await.jobs.get(id).cloned())
    }

    async fn save_job(&self, record: &WorkflowJobRecord) -> Result<WorkflowJobRecord, DbError> {
        let mut saved = record.clone();
        saved.updated_at = chrono::Utc::now();
        self.tables
            .write()
            .await
            .jobs
            .insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn set_job_state(&self, id: &str, next: JobState) -> Result<bool, DbError> {
        let mut tables = self.tables.write().await;
        let Some(job) = tables.jobs.get_mut(id) else {
            return Err(DbError::MissingRecord(format!("workflow job {id}")));
        };
        if !job.state.can_transition_to(next) {
            tracing::debug!(
                job_id = id,
                from = %job.state,
                to = %next,
                "Ignoring state transition"
            );
            return Ok(false);
        }
        job.state = next;
        job.updated_at = chrono::Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ocrd_core::packaging::BagInfo;

    use super::*;
    use crate::store::is_workspace_tombstoned;

    fn info() -> BagInfo {
        BagInfo {
            ocrd_identifier: "bag-1".into(),
            bagit_profile_identifier: "profile".into(),
            ocrd_base_version_checksum: None,
            ocrd_mets: None,
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn workspace_save_and_get() {
        let store = InMemoryStore::new();
        assert!(store.get_workspace("ws").await.unwrap().is_none());

        store
            .save_workspace(&WorkspaceRecord::new("ws", &info(), "d1"))
            .await
            .unwrap();
        let record = store.get_workspace("ws").await.unwrap().expect("saved");
        assert_eq!(record.ocrd_identifier, "bag-1");
        assert_eq!(record.content_digest, "d1");
    }

    #[tokio::test]
    async fn tombstone_is_never_cleared_by_save() {
        let store = InMemoryStore::new();
        assert!(!store.mark_workspace_deleted("ws").await.unwrap());

        store
            .save_workspace(&WorkspaceRecord::new("ws", &info(), "d1"))
            .await
            .unwrap();
        assert!(store.mark_workspace_deleted("ws").await.unwrap());
        assert!(is_workspace_tombstoned(&store, "ws").await.unwrap());

        let saved = store
            .save_workspace(&WorkspaceRecord::new("ws", &info(), "d2"))
            .await
            .unwrap();
        assert!(saved.deleted);
        assert!(is_workspace_tombstoned(&store, "ws").await.unwrap());
    }

    #[tokio::test]
    async fn workflow_tombstone() {
        let store = InMemoryStore::new();
        store
            .save_workflow(&WorkflowRecord::new("wf", "main.nf"))
            .await
            .unwrap();
        assert!(store.mark_workflow_deleted("wf").await.unwrap());
        assert!(store.get_workflow("wf").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn job_state_only_moves_forward() {
        let store = InMemoryStore::new();
        store
            .save_job(&WorkflowJobRecord::queued("job", "wf", "ws"))
            .await
            .unwrap();

        assert!(!store.set_job_state("job", JobState::Success).await.unwrap());
        assert!(store.set_job_state("job", JobState::Running).await.unwrap());
        assert!(store.set_job_state("job", JobState::Success).await.unwrap());
        assert!(!store.set_job_state("job", JobState::Stopped).await.unwrap());
        assert_eq!(
            store.get_job("job").await.unwrap().unwrap().state,
            JobState::Success
        );
    }

    #[tokio::test]
    async fn set_state_of_unknown_job_errors() {
        let store = InMemoryStore::new();
        assert_matches!(
            store.set_job_state("nope", JobState::Running).await,
            Err(DbError::MissingRecord(_))
        );
    }
}
