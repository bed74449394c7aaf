//! Workspace record: bag metadata captured at ingest plus the tombstone flag.

use std::collections::BTreeMap;

use ocrd_core::packaging::BagInfo;
use ocrd_core::types::{ResourceId, Timestamp};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct WorkspaceRecord {
    pub id: ResourceId,
    pub ocrd_identifier: String,
    pub bagit_profile_identifier: String,
    pub ocrd_base_version_checksum: Option<String>,
    pub ocrd_mets: Option<String>,
    /// bag-info keys beyond the ones modelled as columns.
    pub bag_info_adds: Json<BTreeMap<String, String>>,
    /// Payload digest at the time the bag identifier was last assigned.
    pub content_digest: String,
    pub deleted: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkspaceRecord {
    pub fn new(
        id: impl Into<ResourceId>,
        info: &BagInfo,
        content_digest: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            ocrd_identifier: info.ocrd_identifier.clone(),
            bagit_profile_identifier: info.bagit_profile_identifier.clone(),
            ocrd_base_version_checksum: info.ocrd_base_version_checksum.clone(),
            ocrd_mets: info.ocrd_mets.clone(),
            bag_info_adds: Json(info.extra.clone()),
            content_digest: content_digest.into(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reassemble the bag metadata for repacking.
    pub fn bag_info(&self) -> BagInfo {
        BagInfo {
            ocrd_identifier: self.ocrd_identifier.clone(),
            bagit_profile_identifier: self.bagit_profile_identifier.clone(),
            ocrd_base_version_checksum: self.ocrd_base_version_checksum.clone(),
            ocrd_mets: self.ocrd_mets.clone(),
            extra: self.bag_info_adds.0.clone(),
        }
    }
}
