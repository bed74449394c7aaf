use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocrd_broker::memory::InMemoryBroker;
use ocrd_broker::messages::ProcessingMessage;
use ocrd_broker::reconnect::ReconnectConfig;
use ocrd_broker::{BrokerConfig, BrokerConnector, Consumer, Delivery, DeliveryHandler, Publisher};
use tokio::sync::mpsc;

struct Collect(mpsc::UnboundedSender<ProcessingMessage>);

#[async_trait]
impl DeliveryHandler for Collect {
    async fn handle(&self, delivery: Delivery) {
        let message = ProcessingMessage::from_slice(&delivery.body).expect("valid message");
        delivery.ack().await.expect("ack");
        let _ = self.0.send(message);
    }
}

fn config() -> BrokerConfig {
    BrokerConfig {
        reconnect: ReconnectConfig {
            step: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: Some(5),
        },
        ..Default::default()
    }
}

fn message(n: usize) -> ProcessingMessage {
    let mut msg = ProcessingMessage::new(format!("job-{n}"), "ocrd-dummy");
    msg.workspace_id = Some("ws".into());
    msg.input_file_grps = vec!["OCR-D-IMG".into()];
    msg
}

#[tokio::test]
async fn messages_flow_between_two_connectors() {
    let broker = InMemoryBroker::new();

    let producer = BrokerConnector::new(Arc::new(broker.clone()), config());
    let publisher = Publisher::new(producer.clone()).await;
    producer.start();
    producer.wait_ready(Duration::from_secs(2)).await.unwrap();

    let worker = BrokerConnector::new(Arc::new(broker.clone()), config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _consumer = Consumer::start_consuming(
        worker.clone(),
        "ocrd-webapi-default",
        Arc::new(Collect(tx)),
        false,
    )
    .await;
    worker.start();
    worker.wait_ready(Duration::from_secs(2)).await.unwrap();

    for n in 0..3 {
        publisher.publish(&message(n), None, None).await.unwrap();
    }
    let stats = publisher.wait_for_confirms(Duration::from_secs(1)).await.unwrap();
    assert_eq!(stats.acked, 3);

    for n in 0..3 {
        assert_eq!(rx.recv().await.unwrap().job_id, format!("job-{n}"));
    }

    worker.stop().await;
    producer.stop().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn messages_published_during_outage_wait_in_queue() {
    let broker = InMemoryBroker::new();
    let producer = BrokerConnector::new(Arc::new(broker.clone()), config());
    let publisher = Publisher::new(producer.clone()).await;
    producer.start();
    producer.wait_ready(Duration::from_secs(2)).await.unwrap();

    publisher.publish(&message(1), None, None).await.unwrap();

    let worker = BrokerConnector::new(Arc::new(broker.clone()), config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _consumer = Consumer::start_consuming(
        worker.clone(),
        "ocrd-webapi-default",
        Arc::new(Collect(tx)),
        false,
    )
    .await;
    worker.start();

    assert_eq!(rx.recv().await.unwrap().job_id, "job-1");
    worker.stop().await;
    producer.stop().await;
}
