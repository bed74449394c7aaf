//! Transport seam between the connector and a concrete AMQP client.
//!
//! [`BrokerTransport`] opens connections, [`BrokerConnection`] opens
//! channels, and [`BrokerChannel`] carries the AMQP 0-9-1 methods the
//! connector, publisher and consumer need. Two implementations ship with
//! this crate: [`AmqpTransport`](crate::amqp::AmqpTransport) over `lapin`
//! and [`InMemoryBroker`](crate::memory::InMemoryBroker).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Per-channel delivery tag, starting at 1.
pub type DeliveryTag = u64;

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "fanout" => Some(Self::Fanout),
            "topic" => Some(Self::Topic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive a broker restart.
    pub durable: bool,
    /// Only accessible by the declaring connection.
    pub exclusive: bool,
    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
}

/// Basic message properties carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Ask the broker to write the message to disk.
    pub persistent: bool,
}

impl MessageProperties {
    /// `application/json` properties stamped with `app_id`.
    pub fn json(app_id: &str) -> Self {
        Self {
            app_id: Some(app_id.to_string()),
            content_type: Some("application/json".to_string()),
            headers: BTreeMap::new(),
            persistent: true,
        }
    }
}

/// A message as handed over by the transport.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// What a consumer subscription yields.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Delivery(RawDelivery),
    /// The broker cancelled the subscription (e.g. the queue was deleted).
    Cancelled,
}

/// Publisher confirm as sent by the broker in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack { delivery_tag: DeliveryTag, multiple: bool },
    Nack { delivery_tag: DeliveryTag, multiple: bool },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Channel is closed")]
    ChannelClosed,

    /// The broker rejected a method; the channel is closed as a result.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;

    fn is_open(&self) -> bool;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), TransportError>;

    /// Resolves once the connection is closed, for whatever reason.
    async fn closed(&self);
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Enable publisher confirms. Confirmations for subsequent publishes
    /// (tags 1, 2, ...) arrive on the returned receiver.
    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<Confirmation>, TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribe to `queue`. The receiver ends when the subscription or the
    /// channel goes away.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<ConsumerEvent>, TransportError>;

    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), TransportError>;

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    /// Cancel a subscription; returns once the broker confirmed it.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Resolves once the channel is closed, for whatever reason.
    async fn closed(&self);
}
