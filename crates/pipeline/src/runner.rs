//! Job runners: the seam between the workflow lifecycle and the place a
//! job actually executes.
//!
//! [`LocalJobRunner`] spawns the engine as a child process and waits for it
//! on a background task. The broker-routed runner lives in
//! [`dispatch`](crate::dispatch).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ocrd_core::error::CoreError;
use ocrd_core::execution::{JobParams, LocalExecutor};
use ocrd_core::job::JobState;
use ocrd_core::types::ResourceId;
use ocrd_db::RecordStore;

use crate::completion::{CompletionRegistry, JobOutcome};

/// Everything a runner needs to start one job.
#[derive(Debug, Clone)]
pub struct JobLaunch {
    pub job_id: ResourceId,
    pub workflow_id: ResourceId,
    pub workspace_id: ResourceId,
    pub script: PathBuf,
    pub workspace_dir: PathBuf,
    pub job_dir: PathBuf,
    pub params: JobParams,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Hand the job off. Returns once the job has started (local) or has
    /// been accepted for delivery (broker); the end of the job is reported
    /// through the [`CompletionRegistry`].
    async fn launch(&self, launch: JobLaunch) -> Result<(), CoreError>;

    /// Terminal state a status query should record for a job stored as
    /// RUNNING, or `None` to leave it untouched.
    fn observe(&self, job_id: &str, job_dir: &Path) -> Option<JobState>;
}

/// Move a job to a terminal state.
///
/// A job still in QUEUED passes through RUNNING on its way to SUCCESS.
/// Returns whether the state changed; a job that already ended is left
/// as it is.
pub async fn record_terminal(
    store: &dyn RecordStore,
    job_id: &str,
    state: JobState,
) -> Result<bool, CoreError> {
    if state == JobState::Success {
        let current = store.get_job(job_id).await?.map(|job| job.state);
        if current == Some(JobState::Queued) {
            store.set_job_state(job_id, JobState::Running).await?;
        }
    }
    let changed = store.set_job_state(job_id, state).await?;
    if changed {
        tracing::info!(job_id, %state, "Job state recorded");
    } else {
        tracing::debug!(job_id, %state, "Job already in a later state");
    }
    Ok(changed)
}

/// What this process knows about a local child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildStatus {
    Running,
    Exited { success: bool },
}

/// Runs jobs as local engine children.
pub struct LocalJobRunner {
    executor: LocalExecutor,
    store: Arc<dyn RecordStore>,
    completions: Arc<CompletionRegistry>,
    children: Arc<Mutex<HashMap<ResourceId, ChildStatus>>>,
}

impl LocalJobRunner {
    pub fn new(
        executor: LocalExecutor,
        store: Arc<dyn RecordStore>,
        completions: Arc<CompletionRegistry>,
    ) -> Self {
        Self {
            executor,
            store,
            completions,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn executor(&self) -> &LocalExecutor {
        &self.executor
    }

    fn child_status(&self, job_id: &str) -> Option<ChildStatus> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .copied()
    }

    fn forget(&self, job_id: &str) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }

    /// Children this runner still tracks.
    pub fn tracked(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl JobRunner for LocalJobRunner {
    async fn launch(&self, launch: JobLaunch) -> Result<(), CoreError> {
        let running = self.executor.spawn(
            &launch.script,
            &launch.workspace_dir,
            &launch.job_dir,
            &launch.params,
        )?;
        let job_id = launch.job_id;
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone(), ChildStatus::Running);

        let store = Arc::clone(&self.store);
        let completions = Arc::clone(&self.completions);
        let children = Arc::clone(&self.children);
        tokio::spawn(async move {
            let result = running.wait().await;
            children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    job_id.clone(),
                    ChildStatus::Exited {
                        success: result.is_ok(),
                    },
                );

            let outcome = match result {
                Ok(exit) if exit.finished => JobOutcome::success(),
                Ok(_) => {
                    // The entry stays until a status query sees the sentinel.
                    tracing::warn!(
                        job_id = %job_id,
                        "Engine exited cleanly without writing its sentinel; job stays RUNNING",
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Workflow job failed");
                    JobOutcome::stopped(e.to_string())
                }
            };
            if let Err(e) = record_terminal(store.as_ref(), &job_id, outcome.state).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job state");
            }
            children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);
            completions.complete(&job_id, outcome);
        });
        Ok(())
    }

    fn observe(&self, job_id: &str, job_dir: &Path) -> Option<JobState> {
        if !self.executor.is_finished(job_dir) {
            return None;
        }
        match self.child_status(job_id) {
            Some(ChildStatus::Running) => None,
            Some(ChildStatus::Exited { success: true }) => {
                // The caller records the state and completes the handle.
                self.forget(job_id);
                Some(JobState::Success)
            }
            // Already recorded by the waiter.
            Some(ChildStatus::Exited { success: false }) => None,
            // Exit status unknown to this process: sentinel alone reads as STOPPED.
            None => Some(JobState::Stopped),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
