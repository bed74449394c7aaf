//! Directory-backed resource store.
//!
//! [`ResourceStore`] maps an opaque resource id onto a directory under a
//! category-specific root (`<base>/<category>/<id>`). Directory presence is
//! the existence predicate. Creation and deletion of the same id are
//! serialized through a per-id mutex ([`ResourceStore::lock`]), and
//! directories are created with the non-recursive `create_dir` so that two
//! concurrent creates of one id cannot both succeed.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::error::CoreError;
use crate::resource::{Resource, ResourceCategory};
use crate::types::{generate_id, ResourceId};

/// Exclusive hold on one resource id.
///
/// Obtained from [`ResourceStore::lock`]. While held, no other caller can
/// create or delete the resource through the same store.
pub struct ResourceLock {
    id: ResourceId,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceLock {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Maps resource ids of one category onto directories.
///
/// One instance per category is created at startup and shared (via `Arc`)
/// by every component that needs it.
pub struct ResourceStore {
    category: ResourceCategory,
    resource_dir: PathBuf,
    server_url: String,
    locks: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResourceStore {
    /// Open the store rooted at `<base_dir>/<category>`, creating the
    /// directory when it does not exist yet.
    pub async fn open(
        category: ResourceCategory,
        base_dir: impl AsRef<Path>,
        server_url: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let resource_dir = base_dir.as_ref().join(category.as_str());

        if tokio::fs::metadata(&resource_dir).await.is_ok() {
            tracing::info!(
                %category,
                dir = %resource_dir.display(),
                "Using existing base directory"
            );
        } else {
            tokio::fs::create_dir_all(&resource_dir).await?;
            tracing::info!(%category, dir = %resource_dir.display(), "Created base directory");
        }

        Ok(Self {
            category,
            resource_dir,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    /// Root directory of this category (`<base>/<category>`).
    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    /// Acquire the per-id lock for `id`.
    pub async fn lock(&self, id: &str) -> ResourceLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        ResourceLock {
            id: id.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Create the directory for `id`, or for a freshly generated id when
    /// `id` is `None`.
    ///
    /// Fails with [`CoreError::ResourceConflict`] when the directory already
    /// exists; nothing is touched in that case.
    pub async fn create_dir(&self, id: Option<&str>) -> Result<(ResourceId, PathBuf), CoreError> {
        let id = id.map_or_else(generate_id, str::to_string);
        let lock = self.lock(&id).await;
        let path = self.create_locked(&lock).await?;
        Ok((id, path))
    }

    /// Create the directory for an id the caller already holds the lock of.
    pub async fn create_locked(&self, lock: &ResourceLock) -> Result<PathBuf, CoreError> {
        validate_id(lock.id())?;
        let path = self.to_path(lock.id());
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                tracing::debug!(
                    category = %self.category,
                    id = lock.id(),
                    "Created resource directory"
                );
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(
                    category = %self.category,
                    id = lock.id(),
                    "Resource already exists"
                );
                Err(CoreError::conflict(self.category, lock.id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively remove the directory of `id`. A missing directory is
    /// not an error.
    pub async fn delete_dir(&self, id: &str) -> Result<(ResourceId, PathBuf), CoreError> {
        let lock = self.lock(id).await;
        let path = self.delete_locked(&lock).await?;
        Ok((id.to_string(), path))
    }

    /// Remove the directory of an id the caller already holds the lock of.
    pub async fn delete_locked(&self, lock: &ResourceLock) -> Result<PathBuf, CoreError> {
        validate_id(lock.id())?;
        let path = self.to_path(lock.id());
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::debug!(
                    category = %self.category,
                    id = lock.id(),
                    "Removed resource directory"
                );
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(path),
            Err(e) => Err(e.into()),
        }
    }

    /// Local path of `id` if its directory exists.
    pub async fn get_dir(&self, id: &str) -> Option<PathBuf> {
        if validate_id(id).is_err() {
            return None;
        }
        let path = self.to_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Some(path),
            _ => None,
        }
    }

    /// The full [`Resource`] view of `id` if it exists.
    pub async fn get(&self, id: &str) -> Option<Resource> {
        let path = self.get_dir(id).await?;
        Some(Resource {
            id: id.to_string(),
            category: self.category,
            path,
            url: self.to_url(id),
        })
    }

    /// Ids of all resources, one per immediate subdirectory. Order is
    /// unspecified.
    pub async fn list_dirs(&self) -> Result<Vec<ResourceId>, CoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.resource_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Public locators of all resources.
    pub async fn list_urls(&self) -> Result<Vec<String>, CoreError> {
        Ok(self
            .list_dirs()
            .await?
            .iter()
            .map(|id| self.to_url(id))
            .collect())
    }

    /// First file inside the resource directory whose name ends with
    /// `extension` (names compared in sorted order).
    pub async fn find_file(&self, id: &str, extension: &str) -> Result<Option<PathBuf>, CoreError> {
        let Some(dir) = self.get_dir(id).await else {
            return Ok(None);
        };
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.ends_with(extension) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names.into_iter().next().map(|name| dir.join(name)))
    }

    /// Allocate a fresh job directory under an existing resource.
    pub async fn create_job_dir(&self, id: &str) -> Result<(ResourceId, PathBuf), CoreError> {
        if self.get_dir(id).await.is_none() {
            return Err(CoreError::not_found(self.category, id));
        }
        let job_id = generate_id();
        let path = self.job_dir(id, &job_id);
        tokio::fs::create_dir(&path).await?;
        tracing::debug!(category = %self.category, id, job_id = %job_id, "Created job directory");
        Ok((job_id, path))
    }

    // ---- pure path / locator composition ----

    /// Local path of `id`. Does not check existence.
    pub fn to_path(&self, id: &str) -> PathBuf {
        self.resource_dir.join(id)
    }

    /// Local path of a job under `id`. Does not check existence.
    pub fn job_dir(&self, id: &str, job_id: &str) -> PathBuf {
        self.to_path(id).join(job_id)
    }

    /// Public locator of `id`. Does not check existence.
    pub fn to_url(&self, id: &str) -> String {
        format!("{}/{}/{id}", self.server_url, self.category)
    }

    /// Public locator of a job under `id`. Does not check existence.
    pub fn to_job_url(&self, id: &str, job_id: &str) -> String {
        format!("{}/{job_id}", self.to_url(id))
    }
}

/// Reject ids that would escape the category root or collide with
/// hidden staging entries.
fn validate_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(CoreError::Validation(format!("Invalid resource id '{id}'")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;

    use super::*;

    async fn store(base: &Path) -> ResourceStore {
        ResourceStore::open(ResourceCategory::Workspace, base, "http://localhost:8000/")
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn open_creates_category_dir() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;
        assert!(store.resource_dir().is_dir());
        assert!(store.resource_dir().ends_with("workspace"));
    }

    #[tokio::test]
    async fn generated_ids_are_distinct_and_immediately_visible() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let (id, path) = store.create_dir(None).await.expect("create");
            assert_eq!(store.get_dir(&id).await, Some(path));
            assert!(seen.insert(id), "duplicate id generated");
        }
        assert_eq!(store.list_dirs().await.unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn create_existing_id_conflicts_without_mutation() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        let (id, path) = store.create_dir(Some("ws-1")).await.unwrap();
        std::fs::write(path.join("mets.xml"), "<mets/>").unwrap();

        let result = store.create_dir(Some(&id)).await;
        assert_matches!(
            result,
            Err(CoreError::ResourceConflict {
                category: ResourceCategory::Workspace,
                ref id,
            }) if id == "ws-1"
        );
        assert_eq!(std::fs::read_to_string(path.join("mets.xml")).unwrap(), "<mets/>");
        assert_eq!(store.list_dirs().await.unwrap(), vec!["ws-1".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_creates_of_one_id_admit_exactly_one() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(store(base.path()).await);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.create_dir(Some("same")).await }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_matches!(e, CoreError::ResourceConflict { .. }),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        let (id, path) = store.create_dir(None).await.unwrap();
        std::fs::create_dir(path.join("nested")).unwrap();

        let (deleted_id, deleted_path) = store.delete_dir(&id).await.expect("first delete");
        assert_eq!(deleted_id, id);
        assert_eq!(deleted_path, path);
        store.delete_dir(&id).await.expect("second delete must not fail");
        assert!(store.get_dir(&id).await.is_none());
    }

    #[tokio::test]
    async fn list_ignores_plain_files() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        store.create_dir(Some("a")).await.unwrap();
        store.create_dir(Some("b")).await.unwrap();
        std::fs::write(store.resource_dir().join("artifact.zip"), b"zip").unwrap();

        let mut ids = store.list_dirs().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        let urls = store.list_urls().await.unwrap();
        assert!(urls.contains(&"http://localhost:8000/workspace/a".to_string()));
    }

    #[tokio::test]
    async fn urls_are_pure_composition() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        assert_eq!(store.to_url("missing"), "http://localhost:8000/workspace/missing");
        assert_eq!(
            store.to_job_url("missing", "job-7"),
            "http://localhost:8000/workspace/missing/job-7"
        );
    }

    #[tokio::test]
    async fn job_dir_requires_existing_resource() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        assert_matches!(store.create_job_dir("nope").await, Err(CoreError::NotFound { .. }));

        let (id, _) = store.create_dir(None).await.unwrap();
        let (job_id, job_path) = store.create_job_dir(&id).await.unwrap();
        assert!(job_path.is_dir());
        assert_eq!(job_path, store.job_dir(&id, &job_id));
    }

    #[tokio::test]
    async fn find_file_matches_extension() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        let (id, path) = store.create_dir(None).await.unwrap();
        std::fs::write(path.join("readme.txt"), "x").unwrap();
        std::fs::write(path.join("pipeline.nf"), "x").unwrap();

        let found = store.find_file(&id, ".nf").await.unwrap();
        assert_eq!(found, Some(path.join("pipeline.nf")));
        assert_eq!(store.find_file(&id, ".py").await.unwrap(), None);
        assert_eq!(store.find_file("other", ".nf").await.unwrap(), None);
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let base = tempfile::tempdir().unwrap();
        let store = store(base.path()).await;

        assert_matches!(store.create_dir(Some("../escape")).await, Err(CoreError::Validation(_)));
        assert_matches!(store.create_dir(Some(".hidden")).await, Err(CoreError::Validation(_)));
        assert!(store.get_dir("..").await.is_none());
    }
}
