#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ocrd_broker::memory::{ConfirmPolicy, InMemoryBroker};
use ocrd_broker::messages::{ProcessingMessage, ResultMessage};
use ocrd_broker::reconnect::ReconnectConfig;
use ocrd_broker::{BrokerConfig, BrokerConnector, Consumer, Publisher};
use ocrd_core::job::JobState;
use ocrd_worker::{ProcessingHandler, ProcessorRunner, WorkerConfig};

const QUEUE: &str = "ocrd-webapi-default";
const RESULTS: &str = "results";

struct Worker {
    connector: Arc<BrokerConnector>,
    _consumer: Consumer,
}

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        reconnect: ReconnectConfig {
            step: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: Some(5),
        },
        ..Default::default()
    }
}

/// Data root with workspace `ws-1` and a `bin/` of fake processors.
fn layout(root: &Path) -> WorkerConfig {
    let ws = root.join("workspace/ws-1");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("mets.xml"), "<mets/>").unwrap();

    let bin = root.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    install(&bin, "ocrd-fake", "#!/bin/sh\necho \"$@\" >> calls.log\n");
    install(&bin, "ocrd-broken", "#!/bin/sh\necho oops >&2\nexit 1\n");

    WorkerConfig {
        base_dir: root.to_path_buf(),
        mets_name: "mets.xml".into(),
        processor_dir: Some(bin),
    }
}

fn install(bin: &Path, name: &str, body: &str) {
    let path = bin.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn start_worker(broker: &InMemoryBroker, config: WorkerConfig) -> Worker {
    let connector = BrokerConnector::new(Arc::new(broker.clone()), broker_config());
    let publisher = Publisher::new(connector.clone()).await;
    let handler = ProcessingHandler::new(ProcessorRunner::new(config), publisher, RESULTS);
    let consumer =
        Consumer::start_consuming(connector.clone(), QUEUE, Arc::new(handler), false).await;
    connector.start();
    connector.wait_ready(Duration::from_secs(2)).await.unwrap();
    Worker {
        connector,
        _consumer: consumer,
    }
}

fn request(job_id: &str, processor: &str) -> Vec<u8> {
    let mut msg = ProcessingMessage::new(job_id, processor);
    msg.workspace_id = Some("ws-1".into());
    msg.input_file_grps = vec!["OCR-D-IMG".into()];
    msg.output_file_grps = vec!["OCR-D-OUT".into()];
    msg.result_queue_name = Some(RESULTS.into());
    serde_json::to_vec(&msg).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

fn settled(broker: &InMemoryBroker) -> bool {
    broker.queue_len(QUEUE) == 0 && broker.unacked_len(QUEUE) == 0
}

#[tokio::test]
async fn successful_processor_reports_success_then_acks() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let worker = start_worker(&broker, layout(tmp.path())).await;

    broker.inject(QUEUE, request("job-1", "ocrd-fake"));
    eventually(|| broker.queue_len(RESULTS) == 1 && settled(&broker)).await;

    let results = broker.drain_queue(RESULTS);
    let result = ResultMessage::from_slice(&results[0]).unwrap();
    assert_eq!(result.job_id, "job-1");
    assert_eq!(result.state, JobState::Success);
    assert_eq!(result.workspace_id.as_deref(), Some("ws-1"));

    let calls = std::fs::read_to_string(tmp.path().join("workspace/ws-1/calls.log")).unwrap();
    assert!(calls.contains("-I OCR-D-IMG -O OCR-D-OUT"));
    assert!(calls.contains("mets.xml"));
    worker.connector.stop().await;
}

#[tokio::test]
async fn failing_processor_reports_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let worker = start_worker(&broker, layout(tmp.path())).await;

    broker.inject(QUEUE, request("job-2", "ocrd-broken"));
    eventually(|| broker.queue_len(RESULTS) == 1 && settled(&broker)).await;

    let result = ResultMessage::from_slice(&broker.drain_queue(RESULTS)[0]).unwrap();
    assert_eq!(result.state, JobState::Stopped);
    assert!(result.error.unwrap().contains("oops"));
    worker.connector.stop().await;
}

#[tokio::test]
async fn missing_workspace_reports_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let worker = start_worker(&broker, layout(tmp.path())).await;

    let mut msg = ProcessingMessage::new("job-3", "ocrd-fake");
    msg.workspace_id = Some("ws-missing".into());
    msg.input_file_grps = vec!["OCR-D-IMG".into()];
    broker.inject(QUEUE, serde_json::to_vec(&msg).unwrap());
    eventually(|| broker.queue_len(RESULTS) == 1 && settled(&broker)).await;

    let result = ResultMessage::from_slice(&broker.drain_queue(RESULTS)[0]).unwrap();
    assert_eq!(result.state, JobState::Stopped);
    assert!(result.error.unwrap().contains("METS"));
    worker.connector.stop().await;
}

#[tokio::test]
async fn malformed_request_is_dropped_without_result() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let worker = start_worker(&broker, layout(tmp.path())).await;

    broker.inject(QUEUE, b"{\"job_id\": \"x\"}".to_vec());
    broker.inject(QUEUE, request("job-4", "tesseract"));
    eventually(|| settled(&broker)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.queue_len(RESULTS), 0);
    assert!(settled(&broker));
    worker.connector.stop().await;
}

#[tokio::test]
async fn rejected_result_requeues_the_request() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let worker = start_worker(&broker, layout(tmp.path())).await;
    let calls = tmp.path().join("workspace/ws-1/calls.log");

    let runs = || {
        std::fs::read_to_string(&calls)
            .map(|log| log.lines().count())
            .unwrap_or(0)
    };

    broker.set_confirm_policy(ConfirmPolicy::Nack);
    broker.inject(QUEUE, request("job-5", "ocrd-fake"));
    // Each rejected result puts the request back on the queue.
    eventually(|| runs() >= 2).await;
    broker.set_confirm_policy(ConfirmPolicy::Ack);
    eventually(|| settled(&broker)).await;
    assert!(broker.queue_len(RESULTS) >= 2);
    worker.connector.stop().await;
}
