//! Repository for the `workflows` table.

use sqlx::PgPool;

use crate::models::WorkflowRecord;

const COLUMNS: &str = "id, script_name, deleted, created_at, updated_at";

pub struct WorkflowRepo;

impl WorkflowRepo {
    pub async fn find_by_id(
        pool: &PgPool,
        id: &str,
    ) -> Result<Option<WorkflowRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflows WHERE id = $1");
        sqlx::query_as::<_, WorkflowRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn upsert(
        pool: &PgPool,
        record: &WorkflowRecord,
    ) -> Result<WorkflowRecord, sqlx::Error> {
        let query = format!(
            "INSERT INTO workflows (id, script_name) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET script_name = EXCLUDED.script_name, updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, WorkflowRecord>(&query)
            .bind(&record.id)
            .bind(&record.script_name)
            .fetch_one(pool)
            .await
    }

    pub async fn mark_deleted(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workflows SET deleted = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
