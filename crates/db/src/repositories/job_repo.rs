//! Repository for the `workflow_jobs` table.

use ocrd_core::job::JobState;
use sqlx::PgPool;

use crate::models::WorkflowJobRecord;

const COLUMNS: &str = "id, workflow_id, workspace_id, state, created_at, updated_at";

pub struct WorkflowJobRepo;

impl WorkflowJobRepo {
    pub async fn find_by_id(
        pool: &PgPool,
        id: &str,
    ) -> Result<Option<WorkflowJobRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflow_jobs WHERE id = $1");
        sqlx::query_as::<_, WorkflowJobRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn upsert(
        pool: &PgPool,
        record: &WorkflowJobRecord,
    ) -> Result<WorkflowJobRecord, sqlx::Error> {
        let query = format!(
            "INSERT INTO workflow_jobs (id, workflow_id, workspace_id, state) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, WorkflowJobRecord>(&query)
            .bind(&record.id)
            .bind(&record.workflow_id)
            .bind(&record.workspace_id)
            .bind(record.state.as_str())
            .fetch_one(pool)
            .await
    }

    /// Conditional forward transition. Returns `true` if the row moved.
    pub async fn transition(
        pool: &PgPool,
        id: &str,
        next: JobState,
    ) -> Result<bool, sqlx::Error> {
        let from: Vec<String> = JobState::predecessors(next)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let result = sqlx::query(
            "UPDATE workflow_jobs SET state = $2, updated_at = NOW() \
             WHERE id = $1 AND state = ANY($3)",
        )
        .bind(id)
        .bind(next.as_str())
        .bind(&from)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
