//! Workflow lifecycle and job orchestration.
//!
//! A workflow is a directory holding one engine script. Jobs run a workflow
//! against a workspace; each job gets a directory below its workflow and a
//! record in the [`RecordStore`].

use std::path::PathBuf;
use std::sync::Arc;

use ocrd_core::error::CoreError;
use ocrd_core::execution::JobParams;
use ocrd_core::job::JobState;
use ocrd_core::resource::{Resource, ResourceCategory};
use ocrd_core::resource_store::{ResourceLock, ResourceStore};
use ocrd_core::types::generate_id;
use ocrd_db::models::{WorkflowJobRecord, WorkflowRecord};
use ocrd_db::store::is_workflow_tombstoned;
use ocrd_db::RecordStore;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::completion::{CompletionRegistry, JobHandle, JobOutcome};
use crate::runner::{record_terminal, JobLaunch, JobRunner};

/// Extension of engine scripts.
pub const SCRIPT_EXTENSION: &str = ".nf";

pub struct WorkflowLifecycle {
    workflows: Arc<ResourceStore>,
    workspaces: Arc<ResourceStore>,
    records: Arc<dyn RecordStore>,
    runner: Arc<dyn JobRunner>,
    completions: Arc<CompletionRegistry>,
}

impl WorkflowLifecycle {
    pub fn new(
        workflows: Arc<ResourceStore>,
        workspaces: Arc<ResourceStore>,
        records: Arc<dyn RecordStore>,
        runner: Arc<dyn JobRunner>,
        completions: Arc<CompletionRegistry>,
    ) -> Self {
        Self {
            workflows,
            workspaces,
            records,
            runner,
            completions,
        }
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.workflows
    }

    /// Store the script read from `payload` as a new workflow.
    pub async fn create<R>(
        &self,
        payload: R,
        script_name: &str,
        id: Option<&str>,
    ) -> Result<Resource, CoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_script_name(script_name)?;
        let id = id.map_or_else(generate_id, str::to_string);
        let lock = self.workflows.lock(&id).await;
        self.ensure_not_tombstoned(&id).await?;
        self.write_locked(&lock, payload, script_name).await
    }

    /// Replace the script of `id`: delete, then create again. Job
    /// directories of the old workflow are removed with it.
    pub async fn update<R>(
        &self,
        payload: R,
        script_name: &str,
        id: &str,
    ) -> Result<Resource, CoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_script_name(script_name)?;
        let lock = self.workflows.lock(id).await;
        self.ensure_not_tombstoned(id).await?;
        self.workflows.delete_locked(&lock).await?;
        self.write_locked(&lock, payload, script_name).await
    }

    pub async fn get(&self, id: &str) -> Option<Resource> {
        self.workflows.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<String>, CoreError> {
        self.workflows.list_urls().await
    }

    /// Same tombstone rule as workspaces: `Gone` once deleted, `NotFound`
    /// for ids that never existed.
    pub async fn delete(&self, id: &str) -> Result<String, CoreError> {
        let lock = self.workflows.lock(id).await;
        if self.workflows.get_dir(id).await.is_none() {
            return Err(self.missing(id).await);
        }
        self.workflows.delete_locked(&lock).await?;
        if !self.records.mark_workflow_deleted(id).await? {
            tracing::warn!(workflow_id = id, "Deleted workflow had no record to tombstone");
        }
        tracing::info!(workflow_id = id, "Workflow deleted");
        Ok(self.workflows.to_url(id))
    }

    /// Path of the engine script of `id`.
    pub async fn script_path(&self, id: &str) -> Result<PathBuf, CoreError> {
        match self.workflows.find_file(id, SCRIPT_EXTENSION).await? {
            Some(path) => Ok(path),
            None => Err(self.missing(id).await),
        }
    }

    /// Start a job running `workflow_id` against `workspace_id`.
    ///
    /// The job is saved as QUEUED, handed to the runner and then recorded
    /// as RUNNING. A launch failure records STOPPED and surfaces as
    /// [`CoreError::JobDispatch`].
    pub async fn start_job(
        &self,
        workflow_id: &str,
        workspace_id: &str,
        params: JobParams,
    ) -> Result<JobHandle, CoreError> {
        let script = self.script_path(workflow_id).await?;
        let workspace_dir = self
            .workspaces
            .get_dir(workspace_id)
            .await
            .ok_or_else(|| CoreError::not_found(ResourceCategory::Workspace, workspace_id))?;

        let (job_id, job_dir) = self.workflows.create_job_dir(workflow_id).await?;
        self.records
            .save_job(&WorkflowJobRecord::queued(&job_id, workflow_id, workspace_id))
            .await?;
        let handle = self.completions.register(&job_id);

        let launch = JobLaunch {
            job_id: job_id.clone(),
            workflow_id: workflow_id.to_string(),
            workspace_id: workspace_id.to_string(),
            script,
            workspace_dir,
            job_dir,
            params,
        };
        if let Err(e) = self.runner.launch(launch).await {
            tracing::error!(job_id = %job_id, workflow_id, error = %e, "Failed to launch job");
            if let Err(store_err) =
                record_terminal(self.records.as_ref(), &job_id, JobState::Stopped).await
            {
                tracing::error!(job_id = %job_id, error = %store_err, "Failed to record job state");
            }
            self.completions.complete(&job_id, JobOutcome::stopped(e.to_string()));
            return Err(match e {
                CoreError::JobDispatch(_) => e,
                other => CoreError::JobDispatch(other.to_string()),
            });
        }

        if !self.records.set_job_state(&job_id, JobState::Running).await? {
            tracing::debug!(job_id = %job_id, "Job ended before RUNNING was recorded");
        }
        tracing::info!(job_id = %job_id, workflow_id, workspace_id, "Job started");
        Ok(handle)
    }

    /// Current record of a job, after checking whether a RUNNING job has
    /// meanwhile written its sentinel.
    pub async fn job_status(
        &self,
        workflow_id: &str,
        job_id: &str,
    ) -> Result<Option<WorkflowJobRecord>, CoreError> {
        let Some(job) = self.records.get_job(job_id).await? else {
            return Ok(None);
        };
        if job.workflow_id != workflow_id {
            return Ok(None);
        }
        if job.state != JobState::Running {
            return Ok(Some(job));
        }

        let job_dir = self.workflows.job_dir(workflow_id, job_id);
        let Some(state) = self.runner.observe(job_id, &job_dir) else {
            return Ok(Some(job));
        };
        record_terminal(self.records.as_ref(), job_id, state).await?;
        let outcome = match state {
            JobState::Success => JobOutcome::success(),
            _ => JobOutcome::stopped("sentinel present, engine exit status unknown"),
        };
        self.completions.complete(job_id, outcome);
        Ok(self.records.get_job(job_id).await?.or(Some(job)))
    }

    /// `true` once the job is in a terminal state. Unknown jobs are not
    /// finished.
    pub async fn is_job_finished(
        &self,
        workflow_id: &str,
        job_id: &str,
    ) -> Result<bool, CoreError> {
        Ok(self
            .job_status(workflow_id, job_id)
            .await?
            .is_some_and(|job| job.state.is_terminal()))
    }

    pub fn job_url(&self, workflow_id: &str, job_id: &str) -> String {
        self.workflows.to_job_url(workflow_id, job_id)
    }

    // ---- private helpers ----

    async fn ensure_not_tombstoned(&self, id: &str) -> Result<(), CoreError> {
        if is_workflow_tombstoned(self.records.as_ref(), id).await? {
            return Err(CoreError::gone(ResourceCategory::Workflow, id));
        }
        Ok(())
    }

    async fn missing(&self, id: &str) -> CoreError {
        match is_workflow_tombstoned(self.records.as_ref(), id).await {
            Ok(true) => CoreError::gone(ResourceCategory::Workflow, id),
            Ok(false) => CoreError::not_found(ResourceCategory::Workflow, id),
            Err(e) => e.into(),
        }
    }

    async fn write_locked<R>(
        &self,
        lock: &ResourceLock,
        mut payload: R,
        script_name: &str,
    ) -> Result<Resource, CoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = lock.id();
        let dir = self.workflows.create_locked(lock).await?;
        let mut file = tokio::fs::File::create(dir.join(script_name)).await?;
        let bytes = tokio::io::copy(&mut payload, &mut file).await?;
        file.flush().await?;

        self.records
            .save_workflow(&WorkflowRecord::new(id, script_name))
            .await?;
        tracing::info!(workflow_id = id, script = script_name, bytes, "Workflow stored");

        Ok(Resource {
            id: id.to_string(),
            category: ResourceCategory::Workflow,
            path: dir,
            url: self.workflows.to_url(id),
        })
    }
}

/// A bare file name ending in [`SCRIPT_EXTENSION`].
fn validate_script_name(name: &str) -> Result<(), CoreError> {
    let bare = !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\']);
    if !bare || !name.ends_with(SCRIPT_EXTENSION) || name.len() == SCRIPT_EXTENSION.len() {
        return Err(CoreError::Validation(format!(
            "Workflow script name '{name}' must be a plain *{SCRIPT_EXTENSION} file name"
        )));
    }
    Ok(())
}
