//! Workflow job record.

use ocrd_core::job::JobState;
use ocrd_core::types::{ResourceId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// One execution of a workflow against a workspace.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct WorkflowJobRecord {
    pub id: ResourceId,
    pub workflow_id: ResourceId,
    pub workspace_id: ResourceId,
    #[sqlx(try_from = "String")]
    pub state: JobState,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkflowJobRecord {
    /// A fresh record in state `QUEUED`.
    pub fn queued(
        id: impl Into<ResourceId>,
        workflow_id: impl Into<ResourceId>,
        workspace_id: impl Into<ResourceId>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            workspace_id: workspace_id.into(),
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
        }
    }
}
