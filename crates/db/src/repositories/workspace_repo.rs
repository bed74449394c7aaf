//! Repository for the `workspaces` table.

use sqlx::PgPool;

use crate::models::WorkspaceRecord;

/// Column list for `workspaces` queries.
const COLUMNS: &str = "\
    id, ocrd_identifier, bagit_profile_identifier, ocrd_base_version_checksum, \
    ocrd_mets, bag_info_adds, content_digest, deleted, created_at, updated_at";

pub struct WorkspaceRepo;

impl WorkspaceRepo {
    pub async fn find_by_id(
        pool: &PgPool,
        id: &str,
    ) -> Result<Option<WorkspaceRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workspaces WHERE id = $1");
        sqlx::query_as::<_, WorkspaceRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Insert or update by id. `deleted` is left untouched on conflict.
    pub async fn upsert(
        pool: &PgPool,
        record: &WorkspaceRecord,
    ) -> Result<WorkspaceRecord, sqlx::Error> {
        let query = format!(
            "INSERT INTO workspaces \
                 (id, ocrd_identifier, bagit_profile_identifier, ocrd_base_version_checksum, \
                  ocrd_mets, bag_info_adds, content_digest) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET \
                 ocrd_identifier = EXCLUDED.ocrd_identifier, \
                 bagit_profile_identifier = EXCLUDED.bagit_profile_identifier, \
                 ocrd_base_version_checksum = EXCLUDED.ocrd_base_version_checksum, \
                 ocrd_mets = EXCLUDED.ocrd_mets, \
                 bag_info_adds = EXCLUDED.bag_info_adds, \
                 content_digest = EXCLUDED.content_digest, \
                 updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, WorkspaceRecord>(&query)
            .bind(&record.id)
            .bind(&record.ocrd_identifier)
            .bind(&record.bagit_profile_identifier)
            .bind(&record.ocrd_base_version_checksum)
            .bind(&record.ocrd_mets)
            .bind(&record.bag_info_adds)
            .bind(&record.content_digest)
            .fetch_one(pool)
            .await
    }

    /// Set the tombstone. Returns `true` if a row was updated.
    pub async fn mark_deleted(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE workspaces SET deleted = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
