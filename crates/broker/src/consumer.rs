//! Queue consumer that survives reconnects.
//!
//! A [`Consumer`] subscribes to its queue on every new session and feeds
//! deliveries, one at a time, to a [`DeliveryHandler`]. In manual-ack mode
//! each [`Delivery`] must be settled exactly once with [`Delivery::ack`] or
//! [`Delivery::nack`]; both consume the delivery.
//!
//! A broker-side cancellation closes the channel, which makes the
//! connector reconnect and the consumer subscribe again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connector::{BrokerConnector, HookId, Session, SessionHook, SHUTDOWN_TIMEOUT};
use crate::error::BrokerError;
use crate::transport::{
    BrokerChannel, ConsumerEvent, DeliveryTag, MessageProperties, QueueOptions, RawDelivery,
};

#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}

/// A received message. Settle it with [`ack`](Self::ack) or
/// [`nack`](Self::nack) unless the consumer runs in auto-ack mode.
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Delivery {
    fn new(raw: RawDelivery, channel: Option<Arc<dyn BrokerChannel>>) -> Self {
        Self {
            delivery_tag: raw.delivery_tag,
            routing_key: raw.routing_key,
            redelivered: raw.redelivered,
            properties: raw.properties,
            body: raw.body,
            channel,
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub async fn ack(mut self) -> Result<(), BrokerError> {
        if let Some(channel) = self.channel.take() {
            channel.basic_ack(self.delivery_tag, false).await?;
        }
        Ok(())
    }

    /// Reject the message; with `requeue` the broker delivers it again.
    pub async fn nack(mut self, requeue: bool) -> Result<(), BrokerError> {
        if let Some(channel) = self.channel.take() {
            channel.basic_nack(self.delivery_tag, false, requeue).await?;
        }
        Ok(())
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.channel.is_some() {
            tracing::warn!(
                delivery_tag = self.delivery_tag,
                "Delivery dropped without ack or nack; it is redelivered when the channel closes",
            );
        }
    }
}

/// The subscription of one session.
struct Subscription {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    local_cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct ConsumerHook {
    queue: String,
    consumer_tag: String,
    auto_ack: bool,
    handler: Arc<dyn DeliveryHandler>,
    current: tokio::sync::Mutex<Option<Subscription>>,
}

impl ConsumerHook {
    /// Cancel the subscription of `generation` (any when `None`) and wait
    /// for the in-flight handler to finish.
    async fn cancel_subscription(&self, generation: Option<u64>) -> Option<Arc<dyn BrokerChannel>> {
        let mut current = self.current.lock().await;
        if generation.is_some_and(|g| current.as_ref().map(|s| s.generation) != Some(g)) {
            return None;
        }
        let subscription = current.take()?;
        subscription.local_cancel.store(true, Ordering::SeqCst);
        if let Err(e) = subscription.channel.basic_cancel(&self.consumer_tag).await {
            tracing::debug!(error = %e, queue = %self.queue, "basic.cancel failed");
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, subscription.task).await.is_err() {
            tracing::warn!(queue = %self.queue, "Consumer task did not finish in time");
        }
        tracing::info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            "Consumer cancelled"
        );
        Some(subscription.channel)
    }
}

#[async_trait]
impl SessionHook for ConsumerHook {
    async fn session_opened(&self, session: Arc<Session>) -> Result<(), BrokerError> {
        let channel = Arc::clone(session.channel());
        channel
            .queue_declare(
                &self.queue,
                QueueOptions {
                    durable: true,
                    ..Default::default()
                },
            )
            .await?;
        let events = channel
            .basic_consume(&self.queue, &self.consumer_tag, self.auto_ack)
            .await?;
        let local_cancel = Arc::new(AtomicBool::new(false));
        tracing::info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            generation = session.generation(),
            "Consuming",
        );

        let task = tokio::spawn(consume_loop(
            events,
            Arc::clone(&session),
            Arc::clone(&self.handler),
            self.auto_ack,
            Arc::clone(&local_cancel),
        ));
        let previous = self.current.lock().await.replace(Subscription {
            generation: session.generation(),
            channel,
            local_cancel,
            task,
        });
        if let Some(previous) = previous {
            previous.local_cancel.store(true, Ordering::SeqCst);
            previous.task.abort();
        }
        Ok(())
    }

    async fn session_closing(&self, session: &Session) {
        self.cancel_subscription(Some(session.generation())).await;
    }
}

async fn consume_loop(
    mut events: mpsc::UnboundedReceiver<ConsumerEvent>,
    session: Arc<Session>,
    handler: Arc<dyn DeliveryHandler>,
    auto_ack: bool,
    local_cancel: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConsumerEvent::Delivery(raw) => {
                session.record_activity();
                let channel = (!auto_ack).then(|| Arc::clone(session.channel()));
                handler.handle(Delivery::new(raw, channel)).await;
            }
            ConsumerEvent::Cancelled => {
                tracing::warn!(generation = session.generation(), "Broker cancelled consumer");
                break;
            }
        }
    }

    if !local_cancel.load(Ordering::SeqCst) && session.channel().is_open() {
        tracing::info!(generation = session.generation(), "Subscription ended, closing channel");
        if let Err(e) = session.channel().close().await {
            tracing::debug!(error = %e, "Channel close failed");
        }
    }
}

/// Handle to a running subscription.
pub struct Consumer {
    connector: Arc<BrokerConnector>,
    hook_id: HookId,
    hook: Arc<ConsumerHook>,
}

impl Consumer {
    /// Subscribe `handler` to `queue`, now if a session is open and again
    /// after every reconnect.
    pub async fn start_consuming(
        connector: Arc<BrokerConnector>,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        auto_ack: bool,
    ) -> Self {
        let hook = Arc::new(ConsumerHook {
            queue: queue.to_string(),
            consumer_tag: format!("ocrd-{}", uuid::Uuid::new_v4()),
            auto_ack,
            handler,
            current: tokio::sync::Mutex::new(None),
        });
        let hook_id = connector.add_hook(hook.clone()).await;
        Self {
            connector,
            hook_id,
            hook,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.hook.consumer_tag
    }

    /// Stop consuming for good.
    ///
    /// The channel is closed afterwards so unsettled deliveries return to
    /// the queue; the connector then opens a fresh session.
    pub async fn cancel(self) {
        self.connector.remove_hook(self.hook_id).await;
        if let Some(channel) = self.hook.cancel_subscription(None).await {
            if !self.connector.is_stopping() {
                if let Err(e) = channel.close().await {
                    tracing::debug!(error = %e, "Channel close failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
