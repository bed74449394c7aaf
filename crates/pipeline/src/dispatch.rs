//! Broker-routed execution.
//!
//! [`BrokerJobRunner`] turns a job launch into a [`ProcessingMessage`] on
//! the default routing key. Workers answer on the result queue; the
//! [`ResultListener`] applies those answers to the job records and resolves
//! the matching completion handles.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocrd_broker::messages::{ProcessingMessage, ResultMessage};
use ocrd_broker::{BrokerConfig, BrokerConnector, Consumer, Delivery, DeliveryHandler, Publisher};
use ocrd_core::error::CoreError;
use ocrd_core::execution::EngineConfig;
use ocrd_core::job::JobState;
use ocrd_db::RecordStore;

use crate::completion::{CompletionRegistry, JobOutcome};
use crate::runner::{record_terminal, JobLaunch, JobRunner};

/// Publishes one processing message per job.
pub struct BrokerJobRunner {
    publisher: Publisher,
    processor_name: String,
    result_queue: String,
    mets_name: String,
    input_group: String,
}

impl BrokerJobRunner {
    pub fn new(publisher: Publisher, broker: &BrokerConfig, engine: &EngineConfig) -> Self {
        Self {
            publisher,
            processor_name: broker.processor_name.clone(),
            result_queue: broker.result_queue.clone(),
            mets_name: engine.mets_name.clone(),
            input_group: engine.input_group.clone(),
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    fn message(&self, launch: &JobLaunch) -> ProcessingMessage {
        let mets_name = launch.params.mets_name.as_deref().unwrap_or(&self.mets_name);
        let input_group = launch
            .params
            .input_group
            .clone()
            .unwrap_or_else(|| self.input_group.clone());

        let mut message = ProcessingMessage::new(&launch.job_id, &self.processor_name);
        message.workspace_id = Some(launch.workspace_id.clone());
        message.path_to_mets = Some(
            launch
                .workspace_dir
                .join(mets_name)
                .to_string_lossy()
                .into_owned(),
        );
        message.input_file_grps = vec![input_group];
        message.result_queue_name = Some(self.result_queue.clone());
        message.workflow_id = Some(launch.workflow_id.clone());
        message.workflow_script = Some(launch.script.to_string_lossy().into_owned());
        message
    }
}

#[async_trait]
impl JobRunner for BrokerJobRunner {
    async fn launch(&self, launch: JobLaunch) -> Result<(), CoreError> {
        let message = self.message(&launch);
        let delivery_tag = self.publisher.publish(&message, None, None).await?;
        tracing::info!(
            job_id = %launch.job_id,
            processor = %message.processor_name,
            delivery_tag,
            "Published processing message",
        );
        Ok(())
    }

    fn observe(&self, _job_id: &str, _job_dir: &Path) -> Option<JobState> {
        None
    }
}

/// Pause before a result that hit a storage error goes back on the queue.
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

/// What became of one result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Recorded,
    /// No record for the job id; redelivery cannot change that.
    UnknownJob,
}

/// Applies [`ResultMessage`]s from the result queue.
pub struct ResultListener {
    store: Arc<dyn RecordStore>,
    completions: Arc<CompletionRegistry>,
}

impl ResultListener {
    pub fn new(store: Arc<dyn RecordStore>, completions: Arc<CompletionRegistry>) -> Self {
        Self { store, completions }
    }

    /// Subscribe a listener to `queue` on `connector`.
    pub async fn start(
        connector: Arc<BrokerConnector>,
        queue: &str,
        store: Arc<dyn RecordStore>,
        completions: Arc<CompletionRegistry>,
    ) -> Consumer {
        Consumer::start_consuming(
            connector,
            queue,
            Arc::new(Self::new(store, completions)),
            false,
        )
        .await
    }

    async fn apply(&self, result: &ResultMessage) -> Result<Applied, CoreError> {
        if self.store.get_job(&result.job_id).await?.is_none() {
            return Ok(Applied::UnknownJob);
        }
        if !result.state.is_terminal() {
            self.store.set_job_state(&result.job_id, result.state).await?;
            return Ok(Applied::Recorded);
        }
        record_terminal(self.store.as_ref(), &result.job_id, result.state).await?;
        let outcome = JobOutcome {
            state: result.state,
            error: result.error.clone(),
        };
        self.completions.complete(&result.job_id, outcome);
        Ok(Applied::Recorded)
    }
}

#[async_trait]
impl DeliveryHandler for ResultListener {
    async fn handle(&self, delivery: Delivery) {
        let result = match ResultMessage::from_slice(&delivery.body) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed result message");
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "Failed to nack result message");
                }
                return;
            }
        };

        let settled = match self.apply(&result).await {
            Ok(Applied::Recorded) => {
                tracing::info!(
                    job_id = %result.job_id,
                    state = %result.state,
                    "Applied job result"
                );
                delivery.ack().await
            }
            Ok(Applied::UnknownJob) => {
                tracing::warn!(
                    job_id = %result.job_id,
                    state = %result.state,
                    "Discarding result for unknown job"
                );
                delivery.nack(false).await
            }
            Err(e) => {
                tracing::error!(job_id = %result.job_id, error = %e, "Failed to apply job result");
                tokio::time::sleep(REQUEUE_DELAY).await;
                delivery.nack(true).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(job_id = %result.job_id, error = %e, "Failed to settle result message");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
