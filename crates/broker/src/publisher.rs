//! JSON publisher with publisher-confirm bookkeeping.
//!
//! In confirm mode every publish gets the next delivery tag of the channel
//! and sits in [`DeliveryTracker`] until the broker acks or nacks it. Nacked
//! messages are counted and logged, never retried. The tracker starts over
//! on each new session since delivery tags are per channel.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;

use crate::connector::{BrokerConnector, Session, SessionHook};
use crate::error::BrokerError;
use crate::transport::{Confirmation, DeliveryTag, MessageProperties, QueueOptions};

/// Snapshot of the confirm counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub generation: u64,
    pub published: u64,
    pub pending: usize,
    pub acked: u64,
    pub nacked: u64,
}

/// Outstanding delivery tags of one channel.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    generation: u64,
    next_tag: DeliveryTag,
    pending: BTreeSet<DeliveryTag>,
    acked: u64,
    nacked: u64,
}

impl DeliveryTracker {
    /// Forget everything and start tracking `generation` from tag 1.
    pub fn reset(&mut self, generation: u64) {
        *self = Self {
            generation,
            ..Default::default()
        };
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Allocate the tag of the next publish.
    pub fn register(&mut self) -> DeliveryTag {
        self.next_tag += 1;
        self.pending.insert(self.next_tag);
        self.next_tag
    }

    /// Allocate a tag for a publish on a channel without confirms.
    pub fn register_unconfirmed(&mut self) -> DeliveryTag {
        self.next_tag += 1;
        self.next_tag
    }

    /// Give back the tag of a publish the channel refused. Only the latest
    /// tag can be released; the broker never counted it.
    pub fn release(&mut self, tag: DeliveryTag) {
        if tag == self.next_tag && tag > 0 {
            self.pending.remove(&tag);
            self.next_tag -= 1;
        }
    }

    /// Apply a broker confirm. Returns the number of tags it settled.
    pub fn on_confirmation(&mut self, confirmation: Confirmation) -> usize {
        let (tag, multiple, ack) = match confirmation {
            Confirmation::Ack {
                delivery_tag,
                multiple,
            } => (delivery_tag, multiple, true),
            Confirmation::Nack {
                delivery_tag,
                multiple,
            } => (delivery_tag, multiple, false),
        };

        let settled: Vec<DeliveryTag> = if multiple {
            self.pending.range(..=tag).copied().collect()
        } else if self.pending.contains(&tag) {
            vec![tag]
        } else {
            Vec::new()
        };
        for t in &settled {
            self.pending.remove(t);
        }

        let count = settled.len();
        if ack {
            self.acked += count as u64;
        } else {
            self.nacked += count as u64;
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            generation: self.generation,
            published: self.next_tag,
            pending: self.pending.len(),
            acked: self.acked,
            nacked: self.nacked,
        }
    }
}

struct PublisherState {
    tracker: Mutex<DeliveryTracker>,
    confirmed: Notify,
    publish_lock: tokio::sync::Mutex<()>,
}

impl PublisherState {
    fn tracker(&self) -> MutexGuard<'_, DeliveryTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resets the tracker and follows the confirm stream of each new session.
struct ConfirmHook {
    state: Arc<PublisherState>,
}

#[async_trait]
impl SessionHook for ConfirmHook {
    async fn session_opened(&self, session: Arc<Session>) -> Result<(), BrokerError> {
        let generation = session.generation();
        self.state.tracker().reset(generation);

        let Some(mut confirms) = session.take_confirms() else {
            return Ok(());
        };
        let state = Arc::clone(&self.state);
        // Ends when the channel goes away and drops its confirm sender.
        tokio::spawn(async move {
            while let Some(confirmation) = confirms.recv().await {
                {
                    let mut tracker = state.tracker();
                    if tracker.generation() != generation {
                        break;
                    }
                    tracker.on_confirmation(confirmation);
                }
                if let Confirmation::Nack { delivery_tag, multiple } = confirmation {
                    tracing::warn!(generation, delivery_tag, multiple, "Broker nacked publish");
                }
                state.confirmed.notify_waiters();
            }
        });
        Ok(())
    }
}

/// Publishes JSON messages over the connector's current session.
#[derive(Clone)]
pub struct Publisher {
    connector: Arc<BrokerConnector>,
    state: Arc<PublisherState>,
}

impl Publisher {
    /// Create a publisher and register it with `connector`.
    pub async fn new(connector: Arc<BrokerConnector>) -> Self {
        let state = Arc::new(PublisherState {
            tracker: Mutex::new(DeliveryTracker::default()),
            confirmed: Notify::new(),
            publish_lock: tokio::sync::Mutex::new(()),
        });
        connector
            .add_hook(Arc::new(ConfirmHook {
                state: Arc::clone(&state),
            }))
            .await;
        Self { connector, state }
    }

    /// Publish `message` to the configured exchange.
    ///
    /// `routing_key` defaults to the configured one, `properties` to JSON
    /// properties stamped with the configured app id. Returns the delivery
    /// tag of the publish on its channel.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        message: &T,
        routing_key: Option<&str>,
        properties: Option<MessageProperties>,
    ) -> Result<DeliveryTag, BrokerError> {
        let config = self.connector.config();
        let body = serde_json::to_vec(message)?;
        let routing_key = routing_key.unwrap_or(&config.routing_key);
        self.publish_raw(&config.exchange, routing_key, properties, &body)
            .await
    }

    /// Declare `queue` and publish `message` straight to it through the
    /// default exchange.
    pub async fn publish_to_queue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        properties: Option<MessageProperties>,
    ) -> Result<DeliveryTag, BrokerError> {
        let body = serde_json::to_vec(message)?;
        let session = self.current_session()?;
        session
            .channel()
            .queue_declare(
                queue,
                QueueOptions {
                    durable: true,
                    ..Default::default()
                },
            )
            .await?;
        self.publish_raw("", queue, properties, &body).await
    }

    pub fn stats(&self) -> PublishStats {
        self.state.tracker().stats()
    }

    /// Wait until every publish of the current session is confirmed.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<PublishStats, BrokerError> {
        let wait = async {
            loop {
                let notified = self.state.confirmed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let tracker = self.state.tracker();
                    if tracker.pending() == 0 {
                        return tracker.stats();
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BrokerError::Timeout)
    }

    fn current_session(&self) -> Result<Arc<Session>, BrokerError> {
        if self.connector.is_stopping() {
            return Err(BrokerError::Stopped);
        }
        self.connector.session().ok_or(BrokerError::NotConnected)
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Option<MessageProperties>,
        body: &[u8],
    ) -> Result<DeliveryTag, BrokerError> {
        let properties = properties
            .unwrap_or_else(|| MessageProperties::json(&self.connector.config().app_id));

        let _guard = self.state.publish_lock.lock().await;
        let session = self.current_session()?;
        let tag = {
            let mut tracker = self.state.tracker();
            if tracker.generation() != session.generation() {
                tracker.reset(session.generation());
            }
            if session.confirm_mode() {
                tracker.register()
            } else {
                tracker.register_unconfirmed()
            }
        };

        if let Err(e) = session
            .channel()
            .basic_publish(exchange, routing_key, &properties, body)
            .await
        {
            let mut tracker = self.state.tracker();
            if tracker.generation() == session.generation() {
                tracker.release(tag);
            }
            return Err(e.into());
        }
        session.record_activity();
        tracing::debug!(
            exchange,
            routing_key,
            delivery_tag = tag,
            generation = session.generation(),
            "Published message",
        );
        Ok(tag)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
