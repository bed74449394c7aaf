//! Workspace lifecycle: ingest a packaged payload, repack on demand,
//! soft-delete with a tombstone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ocrd_core::error::CoreError;
use ocrd_core::packaging::Packager;
use ocrd_core::resource::{Resource, ResourceCategory};
use ocrd_core::resource_store::{ResourceLock, ResourceStore};
use ocrd_core::types::generate_id;
use ocrd_db::models::WorkspaceRecord;
use ocrd_db::store::is_workspace_tombstoned;
use ocrd_db::RecordStore;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Name of the uploaded archive while it is being unpacked.
const STAGING_FILE: &str = ".payload.zip";

pub struct WorkspaceLifecycle {
    resources: Arc<ResourceStore>,
    records: Arc<dyn RecordStore>,
    packager: Arc<dyn Packager>,
}

impl WorkspaceLifecycle {
    pub fn new(
        resources: Arc<ResourceStore>,
        records: Arc<dyn RecordStore>,
        packager: Arc<dyn Packager>,
    ) -> Self {
        Self {
            resources,
            records,
            packager,
        }
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    /// Create a workspace from a packaged payload.
    ///
    /// A packager rejection surfaces as [`CoreError::Validation`]; the
    /// directory created for the attempt is left in place.
    pub async fn create_from_payload<R>(
        &self,
        payload: R,
        id: Option<&str>,
    ) -> Result<Resource, CoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = id.map_or_else(generate_id, str::to_string);
        let lock = self.resources.lock(&id).await;
        self.ensure_not_tombstoned(&id).await?;
        self.ingest_locked(&lock, payload).await
    }

    /// Replace the content of `id`: delete, then create again.
    ///
    /// Not atomic: if ingest fails after the delete, the workspace is gone.
    pub async fn update<R>(&self, payload: R, id: &str) -> Result<Resource, CoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let lock = self.resources.lock(id).await;
        self.ensure_not_tombstoned(id).await?;
        self.resources.delete_locked(&lock).await?;
        self.ingest_locked(&lock, payload).await
    }

    pub async fn get(&self, id: &str) -> Option<Resource> {
        self.resources.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<String>, CoreError> {
        self.resources.list_urls().await
    }

    /// Write a fresh bag of the current workspace content and return its
    /// path. The caller removes the file when done.
    ///
    /// The stored bag identifier is reused while the content digest is
    /// unchanged; otherwise a new identifier is assigned and persisted.
    pub async fn packaged_artifact(&self, id: &str) -> Result<PathBuf, CoreError> {
        let _lock = self.resources.lock(id).await;
        let Some(dir) = self.resources.get_dir(id).await else {
            return Err(self.missing(id).await);
        };
        let mut record = self
            .records
            .get_workspace(id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("Workspace {id} has no stored record")))?;

        let dest = self
            .resources
            .resource_dir()
            .join(format!("{}.zip", generate_id()));
        let packager = Arc::clone(&self.packager);
        let stored_digest = record.content_digest.clone();
        let mut info = record.bag_info();
        let (info, digest) = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || {
                let digest = packager.content_digest(&dir)?;
                if digest != stored_digest {
                    info.ocrd_identifier = generate_id();
                }
                packager.pack(&dir, &info, &dest)?;
                Ok::<_, CoreError>((info, digest))
            })
            .await
            .map_err(|e| CoreError::Internal(format!("Packing task failed: {e}")))??
        };

        if digest != record.content_digest {
            tracing::info!(
                workspace_id = id,
                ocrd_identifier = %info.ocrd_identifier,
                "Workspace content changed, assigned new bag identifier"
            );
            record.ocrd_identifier = info.ocrd_identifier;
            record.content_digest = digest;
            self.records.save_workspace(&record).await?;
        }
        Ok(dest)
    }

    /// Remove the packaged artifact written by
    /// [`packaged_artifact`](Self::packaged_artifact).
    pub async fn remove_artifact(&self, path: &Path) -> Result<(), CoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the workspace and persist its tombstone. Returns the
    /// locator of the deleted workspace.
    pub async fn delete(&self, id: &str) -> Result<String, CoreError> {
        let lock = self.resources.lock(id).await;
        if self.resources.get_dir(id).await.is_none() {
            return Err(self.missing(id).await);
        }
        self.resources.delete_locked(&lock).await?;
        if !self.records.mark_workspace_deleted(id).await? {
            tracing::warn!(workspace_id = id, "Deleted workspace had no record to tombstone");
        }
        tracing::info!(workspace_id = id, "Workspace deleted");
        Ok(self.resources.to_url(id))
    }

    // ---- private helpers ----

    async fn ensure_not_tombstoned(&self, id: &str) -> Result<(), CoreError> {
        if is_workspace_tombstoned(self.records.as_ref(), id).await? {
            return Err(CoreError::gone(ResourceCategory::Workspace, id));
        }
        Ok(())
    }

    /// `Gone` for a tombstoned id, `NotFound` otherwise.
    async fn missing(&self, id: &str) -> CoreError {
        match is_workspace_tombstoned(self.records.as_ref(), id).await {
            Ok(true) => CoreError::gone(ResourceCategory::Workspace, id),
            Ok(false) => CoreError::not_found(ResourceCategory::Workspace, id),
            Err(e) => e.into(),
        }
    }

    async fn ingest_locked<R>(
        &self,
        lock: &ResourceLock,
        mut payload: R,
    ) -> Result<Resource, CoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = lock.id();
        let dir = self.resources.create_locked(lock).await?;
        let staging = dir.join(STAGING_FILE);

        let mut file = tokio::fs::File::create(&staging).await?;
        let bytes = tokio::io::copy(&mut payload, &mut file).await?;
        file.flush().await?;
        drop(file);
        tracing::debug!(workspace_id = id, bytes, "Payload staged");

        let packager = Arc::clone(&self.packager);
        let (archive, dest) = (staging.clone(), dir.clone());
        let unpacked = tokio::task::spawn_blocking(move || packager.unpack(&archive, &dest))
            .await
            .map_err(|e| CoreError::Internal(format!("Unpack task failed: {e}")))?;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            tracing::warn!(workspace_id = id, error = %e, "Failed to remove staged payload");
        }
        let outcome = unpacked.map_err(|e| {
            tracing::warn!(workspace_id = id, error = %e, "Payload rejected");
            CoreError::from(e)
        })?;

        let record = WorkspaceRecord::new(id, &outcome.info, outcome.content_digest);
        self.records.save_workspace(&record).await?;
        tracing::info!(
            workspace_id = id,
            ocrd_identifier = %record.ocrd_identifier,
            "Workspace created"
        );

        Ok(Resource {
            id: id.to_string(),
            category: ResourceCategory::Workspace,
            path: dir,
            url: self.resources.to_url(id),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
