//! Per-job completion channels.
//!
//! Every started job gets a [`JobHandle`] from the [`CompletionRegistry`].
//! Whichever path observes the end of the job (the local child wait, a
//! status query that finds the sentinel, or a broker result message) calls
//! [`CompletionRegistry::complete`], which resolves the handle.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ocrd_core::error::CoreError;
use ocrd_core::job::JobState;
use ocrd_core::types::ResourceId;
use serde::Serialize;
use tokio::sync::watch;

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub state: JobState,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            state: JobState::Success,
            error: None,
        }
    }

    pub fn stopped(error: impl Into<String>) -> Self {
        Self {
            state: JobState::Stopped,
            error: Some(error.into()),
        }
    }
}

/// Awaitable view on one job's completion.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: ResourceId,
    rx: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The outcome if the job has already ended.
    pub fn try_outcome(&self) -> Option<JobOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait until the job ends.
    ///
    /// Fails with [`CoreError::Internal`] when the registry dropped the job
    /// without an outcome, e.g. on shutdown.
    pub async fn wait(mut self) -> Result<JobOutcome, CoreError> {
        let outcome = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                CoreError::Internal(format!("Completion channel for job {} closed", self.job_id))
            })?
            .clone();
        outcome.ok_or_else(|| CoreError::Internal("completion resolved without outcome".into()))
    }
}

/// Open completion channels, keyed by job id.
#[derive(Default)]
pub struct CompletionRegistry {
    senders: Mutex<HashMap<ResourceId, watch::Sender<Option<JobOutcome>>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `job_id` and return its handle. Registering an id
    /// twice hands out receivers of the same channel.
    pub fn register(&self, job_id: &str) -> JobHandle {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = senders
            .entry(job_id.to_string())
            .or_insert_with(|| watch::channel(None).0);
        JobHandle {
            job_id: job_id.to_string(),
            rx: sender.subscribe(),
        }
    }

    /// Resolve the handle of `job_id`. Returns `false` when no channel is
    /// open for it (unknown or already completed).
    pub fn complete(&self, job_id: &str, outcome: JobOutcome) -> bool {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        match sender {
            Some(sender) => {
                tracing::debug!(job_id, state = %outcome.state, "Job completed");
                sender.send_replace(Some(outcome));
                true
            }
            None => false,
        }
    }

    /// Number of jobs still waiting for an outcome.
    pub fn pending(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn handle_resolves_once_completed() {
        let registry = CompletionRegistry::new();
        let handle = registry.register("job-1");
        assert!(handle.try_outcome().is_none());
        assert_eq!(registry.pending(), 1);

        let waiter = tokio::spawn(handle.clone().wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.complete("job-1", JobOutcome::success()));

        assert_eq!(waiter.await.unwrap().unwrap(), JobOutcome::success());
        assert_eq!(handle.try_outcome(), Some(JobOutcome::success()));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn outcome_survives_after_completion() {
        let registry = CompletionRegistry::new();
        let handle = registry.register("job-1");
        registry.complete("job-1", JobOutcome::stopped("exit 3"));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, JobState::Stopped);
        assert_eq!(outcome.error.as_deref(), Some("exit 3"));
    }

    #[test]
    fn second_completion_is_ignored() {
        let registry = CompletionRegistry::new();
        let handle = registry.register("job-1");
        assert!(registry.complete("job-1", JobOutcome::success()));
        assert!(!registry.complete("job-1", JobOutcome::stopped("late")));
        assert_eq!(handle.try_outcome(), Some(JobOutcome::success()));
    }

    #[tokio::test]
    async fn dropped_registry_fails_waiters() {
        let registry = CompletionRegistry::new();
        let handle = registry.register("job-1");
        drop(registry);
        assert_matches!(handle.wait().await, Err(CoreError::Internal(_)));
    }
}
