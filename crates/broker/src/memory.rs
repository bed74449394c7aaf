//! In-process AMQP broker.
//!
//! Models the parts of AMQP 0-9-1 the connector relies on: direct/fanout
//! routing plus the default exchange, per-channel delivery tags, prefetch,
//! requeue of unacknowledged messages when a channel closes, publisher
//! confirms, and consumer cancellation. Failure injection hooks
//! ([`InMemoryBroker::fail_next_connects`], [`InMemoryBroker::drop_connections`],
//! [`InMemoryBroker::cancel_consumers`]) let tests drive reconnection paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Confirmation, ConsumerEvent, DeliveryTag,
    ExchangeKind, MessageProperties, QueueOptions, RawDelivery, TransportError,
};

/// How the broker answers publishes on confirm-mode channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmPolicy {
    /// Ack every publish individually.
    #[default]
    Ack,
    /// Nack every publish individually.
    Nack,
    /// Withhold confirms until [`InMemoryBroker::release_held_confirms`].
    Hold,
}

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct ConsumerSlot {
    connection: u64,
    channel: u16,
    tag: String,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ChannelState {
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, (String, Stored)>,
    confirms: Option<mpsc::UnboundedSender<Confirmation>>,
    publish_seq: DeliveryTag,
    held: Vec<DeliveryTag>,
    closed_tx: watch::Sender<bool>,
}

struct ConnectionState {
    channels: HashMap<u16, ChannelState>,
    next_channel: u16,
    closed_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    next_connection: u64,
    fail_next_connects: u32,
    connect_attempts: u32,
    confirm_policy: ConfirmPolicy,
}

impl State {
    fn channel_mut(
        &mut self,
        connection: u64,
        channel: u16,
    ) -> Result<&mut ChannelState, TransportError> {
        self.connections
            .get_mut(&connection)
            .and_then(|c| c.channels.get_mut(&channel))
            .ok_or(TransportError::ChannelClosed)
    }

    fn has_channel(&self, connection: u64, channel: u16) -> bool {
        self.connections
            .get(&connection)
            .is_some_and(|c| c.channels.contains_key(&channel))
    }

    /// Close a channel: drop its consumers and requeue what it had not
    /// acknowledged, in original order.
    fn close_channel(&mut self, connection: u64, channel: u16) {
        let Some(state) = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.channels.remove(&channel))
        else {
            return;
        };

        let mut touched: Vec<String> = Vec::new();
        for (_, (queue, mut message)) in state.unacked.into_iter().rev() {
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        for (name, q) in self.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers
                .retain(|c| !(c.connection == connection && c.channel == channel));
            if q.consumers.len() != before && !touched.contains(name) {
                touched.push(name.clone());
            }
        }
        let _ = state.closed_tx.send(true);
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let channels: Vec<u16> = match self.connections.get(&connection) {
            Some(c) => c.channels.keys().copied().collect(),
            None => return,
        };
        for channel in channels {
            self.close_channel(connection, channel);
        }
        if let Some(state) = self.connections.remove(&connection) {
            let _ = state.closed_tx.send(true);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            TransportError::Protocol(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| *kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect())
    }

    fn enqueue(&mut self, queue: &str, message: Stored) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    /// Hand ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue: &str) {
        let State {
            queues,
            connections,
            ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() {
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.consumers.is_empty() {
                return;
            }

            let count = q.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (q.next_consumer + offset) % count;
                let slot = &q.consumers[index];
                let Some(channel) = connections
                    .get(&slot.connection)
                    .and_then(|c| c.channels.get(&slot.channel))
                else {
                    continue;
                };
                let has_capacity = slot.auto_ack
                    || channel.prefetch == 0
                    || channel.unacked.len() < usize::from(channel.prefetch);
                if has_capacity {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                return;
            };
            q.next_consumer = (index + 1) % count;

            let Some(message) = q.ready.pop_front() else {
                return;
            };
            let slot = &q.consumers[index];
            let Some(channel) = connections
                .get_mut(&slot.connection)
                .and_then(|c| c.channels.get_mut(&slot.channel))
            else {
                q.ready.push_front(message);
                return;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            if !slot.auto_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue.to_string(), message.clone()));
            }
            let delivery = RawDelivery {
                delivery_tag,
                exchange: message.exchange,
                routing_key: message.routing_key,
                redelivered: message.redelivered,
                properties: message.properties,
                body: message.body,
            };
            let _ = slot.tx.send(ConsumerEvent::Delivery(delivery));
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().fail_next_connects = count;
    }

    /// Number of connection attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    pub fn set_confirm_policy(&self, policy: ConfirmPolicy) {
        self.shared.lock().confirm_policy = policy;
    }

    /// Ack everything withheld under [`ConfirmPolicy::Hold`] with a single
    /// `multiple` ack per channel.
    pub fn release_held_confirms(&self) {
        let mut state = self.shared.lock();
        for connection in state.connections.values_mut() {
            for channel in connection.channels.values_mut() {
                if let (Some(max), Some(tx)) =
                    (channel.held.iter().max().copied(), &channel.confirms)
                {
                    let _ = tx.send(Confirmation::Ack {
                        delivery_tag: max,
                        multiple: true,
                    });
                }
                channel.held.clear();
            }
        }
    }

    /// Close every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Cancel every subscription on `queue` from the broker side.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.shared.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            for slot in q.consumers.drain(..) {
                let _ = slot.tx.send(ConsumerEvent::Cancelled);
            }
        }
    }

    /// Messages waiting for a consumer.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        let state = self.shared.lock();
        state
            .connections
            .values()
            .flat_map(|c| c.channels.values())
            .flat_map(|ch| ch.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Put a raw message straight onto `queue`, declaring it if needed.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.shared.lock();
        state.queues.entry(queue.to_string()).or_default();
        state.enqueue(
            queue,
            Stored {
                exchange: String::new(),
                routing_key: queue.to_string(),
                properties: MessageProperties::default(),
                body: body.into(),
                redelivered: false,
            },
        );
    }

    /// Remove and return the bodies of all ready messages on `queue`.
    pub fn drain_queue(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.shared.lock();
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let mut state = self.shared.lock();
        state.connect_attempts += 1;
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (closed_tx, closed_rx) = watch::channel(false);
        state.connections.insert(
            id,
            ConnectionState {
                channels: HashMap::new(),
                next_channel: 0,
                closed_tx,
            },
        );
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
            closed_rx,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let mut state = self.shared.lock();
        let connection = state
            .connections
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        connection.next_channel += 1;
        let id = connection.next_channel;
        let (closed_tx, closed_rx) = watch::channel(false);
        connection.channels.insert(
            id,
            ChannelState {
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                confirms: None,
                publish_seq: 0,
                held: Vec::new(),
                closed_tx,
            },
        );
        Ok(Box::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            connection: self.id,
            id,
            closed_rx,
        }))
    }

    fn is_open(&self) -> bool {
        self.shared.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.lock().close_connection(self.id);
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    connection: u64,
    id: u16,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    /// Run `f` against the live state; a protocol error closes the channel.
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut State) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut state = self.shared.lock();
        if !state.has_channel(self.connection, self.id) {
            return Err(TransportError::ChannelClosed);
        }
        let result = f(&mut state);
        if let Err(TransportError::Protocol(_)) = &result {
            state.close_channel(self.connection, self.id);
        }
        result
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.lock().has_channel(self.connection, self.id)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        self.with_state(|state| match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TransportError::Protocol(format!(
                "PRECONDITION_FAILED - exchange '{name}' redeclared with a different type"
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        })
    }

    async fn queue_declare(
        &self,
        name: &str,
        _options: QueueOptions,
    ) -> Result<(), TransportError> {
        self.with_state(|state| {
            state.queues.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(TransportError::Protocol(format!("NOT_FOUND - no queue '{queue}'")));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(TransportError::Protocol(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            }
            let exists = state.bindings.iter().any(|b| {
                b.exchange == exchange && b.routing_key == routing_key && b.queue == queue
            });
            if !exists {
                state.bindings.push(Binding {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    queue: queue.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            state.channel_mut(connection, id)?.prefetch = prefetch_count;
            Ok(())
        })
    }

    async fn confirm_select(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Confirmation>, TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            let (tx, rx) = mpsc::unbounded_channel();
            let channel = state.channel_mut(connection, id)?;
            channel.confirms = Some(tx);
            channel.publish_seq = 0;
            Ok(rx)
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            let queues = state.route(exchange, routing_key)?;
            let policy = state.confirm_policy;
            let channel = state.channel_mut(connection, id)?;
            if let Some(tx) = &channel.confirms {
                channel.publish_seq += 1;
                let delivery_tag = channel.publish_seq;
                match policy {
                    ConfirmPolicy::Ack => {
                        let _ = tx.send(Confirmation::Ack {
                            delivery_tag,
                            multiple: false,
                        });
                    }
                    ConfirmPolicy::Nack => {
                        let _ = tx.send(Confirmation::Nack {
                            delivery_tag,
                            multiple: false,
                        });
                    }
                    ConfirmPolicy::Hold => channel.held.push(delivery_tag),
                }
            }
            for queue in queues {
                state.enqueue(
                    &queue,
                    Stored {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        properties: properties.clone(),
                        body: body.to_vec(),
                        redelivered: false,
                    },
                );
            }
            Ok(())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<ConsumerEvent>, TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(TransportError::Protocol(format!("NOT_FOUND - no queue '{queue}'")));
            };
            let (tx, rx) = mpsc::unbounded_channel();
            q.consumers.push(ConsumerSlot {
                connection,
                channel: id,
                tag: consumer_tag.to_string(),
                auto_ack,
                tx,
            });
            state.dispatch(queue);
            Ok(rx)
        })
    }

    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            let channel = state.channel_mut(connection, id)?;
            let tags: Vec<DeliveryTag> = if multiple {
                channel.unacked.range(..=delivery_tag).map(|(t, _)| *t).collect()
            } else if channel.unacked.contains_key(&delivery_tag) {
                vec![delivery_tag]
            } else {
                Vec::new()
            };
            if tags.is_empty() {
                return Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )));
            }
            let mut touched = Vec::new();
            for tag in tags {
                if let Some((queue, _)) = channel.unacked.remove(&tag) {
                    touched.push(queue);
                }
            }
            for queue in touched {
                state.dispatch(&queue);
            }
            Ok(())
        })
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            let channel = state.channel_mut(connection, id)?;
            let tags: Vec<DeliveryTag> = if multiple {
                channel.unacked.range(..=delivery_tag).map(|(t, _)| *t).collect()
            } else if channel.unacked.contains_key(&delivery_tag) {
                vec![delivery_tag]
            } else {
                Vec::new()
            };
            if tags.is_empty() {
                return Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )));
            }
            let mut removed = Vec::new();
            for tag in tags {
                if let Some(entry) = channel.unacked.remove(&tag) {
                    removed.push(entry);
                }
            }
            let mut touched: Vec<String> = Vec::new();
            for (queue, mut message) in removed {
                if requeue {
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_back(message);
                    }
                }
                if !touched.contains(&queue) {
                    touched.push(queue);
                }
            }
            for queue in touched {
                state.dispatch(&queue);
            }
            Ok(())
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let (connection, id) = (self.connection, self.id);
        self.with_state(|state| {
            for q in state.queues.values_mut() {
                q.consumers.retain(|c| {
                    !(c.connection == connection && c.channel == id && c.tag == consumer_tag)
                });
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.lock().close_channel(self.connection, self.id);
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    async fn channel(
        broker: &InMemoryBroker,
    ) -> (Box<dyn BrokerConnection>, Box<dyn BrokerChannel>) {
        let connection = broker.connect().await.expect("connect");
        let channel = connection.open_channel().await.expect("channel");
        channel
            .exchange_declare("ex", ExchangeKind::Direct, false)
            .await
            .unwrap();
        channel.queue_declare("q", QueueOptions::default()).await.unwrap();
        channel.queue_bind("q", "ex", "key").await.unwrap();
        (connection, channel)
    }

    fn body(event: ConsumerEvent) -> RawDelivery {
        match event {
            ConsumerEvent::Delivery(d) => d,
            ConsumerEvent::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[tokio::test]
    async fn direct_routing_and_default_exchange() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let props = MessageProperties::default();

        ch.basic_publish("ex", "key", &props, b"one").await.unwrap();
        ch.basic_publish("ex", "other", &props, b"dropped").await.unwrap();
        ch.basic_publish("", "q", &props, b"two").await.unwrap();
        assert_eq!(broker.queue_len("q"), 2);
        assert_eq!(broker.drain_queue("q"), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.basic_qos(1).await.unwrap();
        for i in 0..3u8 {
            ch.basic_publish("ex", "key", &MessageProperties::default(), &[i])
                .await
                .unwrap();
        }

        let mut rx = ch.basic_consume("q", "c1", false).await.unwrap();
        let first = body(rx.recv().await.unwrap());
        assert_eq!(first.delivery_tag, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.unacked_len("q"), 1);

        ch.basic_ack(first.delivery_tag, false).await.unwrap();
        let second = body(rx.recv().await.unwrap());
        assert_eq!(second.delivery_tag, 2);
        assert_eq!(second.body, vec![1]);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        ch.basic_publish("ex", "key", &MessageProperties::default(), b"m")
            .await
            .unwrap();
        let mut rx = ch.basic_consume("q", "c1", false).await.unwrap();
        let _ = body(rx.recv().await.unwrap());

        ch.close().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.queue_len("q"), 1);

        let ch2 = conn.open_channel().await.unwrap();
        let mut rx2 = ch2.basic_consume("q", "c2", true).await.unwrap();
        let again = body(rx2.recv().await.unwrap());
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn confirms_follow_publish_sequence() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let mut confirms = ch.confirm_select().await.unwrap();
        ch.basic_publish("ex", "key", &MessageProperties::default(), b"a").await.unwrap();
        ch.basic_publish("ex", "key", &MessageProperties::default(), b"b").await.unwrap();

        assert_eq!(
            confirms.recv().await,
            Some(Confirmation::Ack { delivery_tag: 1, multiple: false })
        );
        assert_eq!(
            confirms.recv().await,
            Some(Confirmation::Ack { delivery_tag: 2, multiple: false })
        );
    }

    #[tokio::test]
    async fn protocol_error_closes_the_channel() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;

        let result = ch
            .basic_publish("missing", "key", &MessageProperties::default(), b"x")
            .await;
        assert_matches!(result, Err(TransportError::Protocol(_)));
        assert!(!ch.is_open());
        ch.closed().await;
        assert_matches!(ch.basic_qos(1).await, Err(TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn injected_connect_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn dropping_connections_signals_closed() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        broker.drop_connections();
        conn.closed().await;
        ch.closed().await;
        assert!(!conn.is_open());
        assert_eq!(broker.open_connections(), 0);
    }
}
