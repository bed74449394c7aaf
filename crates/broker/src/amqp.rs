//! RabbitMQ transport over `lapin`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch};

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Confirmation, ConsumerEvent, DeliveryTag,
    ExchangeKind, MessageProperties, QueueOptions, RawDelivery, TransportError,
};

/// `lapin` has no channel-close notification; status is polled this often.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connects to the broker at an `amqp://` URL.
pub struct AmqpTransport {
    url: String,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let on_error_tx = Arc::clone(&closed_tx);
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "AMQP connection error");
            on_error_tx.send_replace(true);
        });

        Ok(Box::new(AmqpConnection {
            connection,
            closed_tx,
            closed_rx,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| connection_error(&self.connection, e))?;
        Ok(Box::new(AmqpChannel {
            channel,
            connection_closed: self.closed_rx.clone(),
            confirms: Mutex::new(None),
            publish_seq: AtomicU64::new(0),
            local_cancels: Arc::new(Mutex::new(HashSet::new())),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow() && self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))
        } else {
            Ok(())
        };
        self.closed_tx.send_replace(true);
        result
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        tokio::select! {
            _ = rx.wait_for(|closed| *closed) => {}
            _ = poll_until(|| !self.connection.status().connected()) => {}
        }
    }
}

struct AmqpChannel {
    channel: Channel,
    connection_closed: watch::Receiver<bool>,
    confirms: Mutex<Option<mpsc::UnboundedSender<Confirmation>>>,
    publish_seq: AtomicU64,
    local_cancels: Arc<Mutex<HashSet<String>>>,
}

impl AmqpChannel {
    fn error(&self, err: lapin::Error) -> TransportError {
        if self.channel.status().connected() {
            TransportError::Protocol(err.to_string())
        } else {
            TransportError::ChannelClosed
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.error(e))
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| self.error(e))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.error(e))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn confirm_select(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Confirmation>, TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| self.error(e))?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.publish_seq.store(0, Ordering::SeqCst);
        Ok(rx)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let pending = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| self.error(e))?;

        let confirms = self
            .confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = confirms {
            let delivery_tag = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                let confirmation = match pending.await {
                    Ok(c) if c.is_ack() => Confirmation::Ack {
                        delivery_tag,
                        multiple: false,
                    },
                    Ok(c) if c.is_nack() => Confirmation::Nack {
                        delivery_tag,
                        multiple: false,
                    },
                    Ok(_) => return,
                    Err(e) => {
                        tracing::debug!(delivery_tag, error = %e, "Publisher confirm lost");
                        return;
                    }
                };
                let _ = tx.send(confirmation);
            });
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<ConsumerEvent>, TransportError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.error(e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();
        let local_cancels = Arc::clone(&self.local_cancels);
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let raw = RawDelivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            properties: from_basic_properties(&delivery.properties),
                            body: delivery.data,
                        };
                        if tx.send(ConsumerEvent::Delivery(raw)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            consumer_tag = %tag,
                            error = %e,
                            "AMQP consumer stream failed"
                        );
                        return;
                    }
                }
            }
            let local = local_cancels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&tag);
            if !local && channel.status().connected() {
                let _ = tx.send(ConsumerEvent::Cancelled);
            }
        });
        Ok(rx)
    }

    async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| self.error(e))
    }

    async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| self.error(e))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.local_cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer_tag.to_string());
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.error(e))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| self.error(e))
    }

    async fn closed(&self) {
        let mut rx = self.connection_closed.clone();
        tokio::select! {
            _ = rx.wait_for(|closed| *closed) => {}
            _ = poll_until(|| !self.channel.status().connected()) => {}
        }
    }
}

fn connection_error(connection: &Connection, err: lapin::Error) -> TransportError {
    if connection.status().connected() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::ConnectionClosed
    }
}

async fn poll_until(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        basic = basic.with_headers(table);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let headers: BTreeMap<String, String> = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(s) => Some((
                        key.as_str().to_string(),
                        String::from_utf8_lossy(s.as_bytes()).into_owned(),
                    )),
                    AMQPValue::ShortString(s) => {
                        Some((key.as_str().to_string(), s.as_str().to_string()))
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        app_id: basic.app_id().as_ref().map(|s| s.as_str().to_string()),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers,
        persistent: *basic.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
    }
}
