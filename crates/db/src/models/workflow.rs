use ocrd_core::types::{ResourceId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A stored workflow script.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct WorkflowRecord {
    pub id: ResourceId,
    /// File name of the script inside the workflow directory.
    pub script_name: String,
    pub deleted: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkflowRecord {
    pub fn new(id: impl Into<ResourceId>, script_name: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            script_name: script_name.into(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}
