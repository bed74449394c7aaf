//! Delivery handler for processing messages.
//!
//! A delivery is acked only after its result message has been published
//! and confirmed by the broker. Undecodable requests are nacked without
//! requeue; a result that cannot be published nacks the request with
//! requeue so another worker can retry it.

use std::time::Duration;

use async_trait::async_trait;
use ocrd_broker::messages::{ProcessingMessage, ResultMessage};
use ocrd_broker::{BrokerError, Delivery, DeliveryHandler, Publisher};
use ocrd_core::job::JobState;

use crate::processor::ProcessorRunner;

/// How long to wait for the broker to confirm a result.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProcessingHandler {
    runner: ProcessorRunner,
    publisher: Publisher,
    /// Used when a request names no result queue.
    default_result_queue: String,
}

impl ProcessingHandler {
    pub fn new(
        runner: ProcessorRunner,
        publisher: Publisher,
        default_result_queue: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            publisher,
            default_result_queue: default_result_queue.into(),
        }
    }

    async fn report(
        &self,
        request: &ProcessingMessage,
        result: &ResultMessage,
    ) -> Result<(), BrokerError> {
        let queue = request
            .result_queue_name
            .as_deref()
            .unwrap_or(&self.default_result_queue);
        let before = self.publisher.stats();
        self.publisher.publish_to_queue(queue, result, None).await?;
        let stats = self.publisher.wait_for_confirms(CONFIRM_TIMEOUT).await?;
        if stats.generation == before.generation && stats.nacked > before.nacked {
            return Err(BrokerError::Rejected);
        }
        tracing::debug!(
            job_id = %request.job_id,
            queue,
            acked = stats.acked,
            nacked = stats.nacked,
            "Result published"
        );
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for ProcessingHandler {
    async fn handle(&self, delivery: Delivery) {
        let request = match ProcessingMessage::from_slice(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting processing message");
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "Failed to nack processing message");
                }
                return;
            }
        };

        let result = match self.runner.run(&request).await {
            Ok(()) => ResultMessage::for_request(&request, JobState::Success, None),
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Processing failed");
                ResultMessage::for_request(&request, JobState::Stopped, Some(e.to_string()))
            }
        };

        let settled = match self.report(&request, &result).await {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to publish result");
                delivery.nack(true).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(
                job_id = %request.job_id,
                error = %e,
                "Failed to settle processing message"
            );
        }
    }
}
