use std::sync::Arc;

use anyhow::Context;
use ocrd_broker::amqp::AmqpTransport;
use ocrd_broker::{BrokerConfig, BrokerConnector, Consumer, Publisher};
use ocrd_core::config::AppConfig;
use ocrd_worker::{ProcessingHandler, ProcessorRunner, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocrd_worker=info,ocrd_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let app = AppConfig::from_env().context("Invalid application configuration")?;
    let broker = BrokerConfig::from_env().context("Invalid broker configuration")?;
    let worker = WorkerConfig::from_env(&app).context("Invalid worker configuration")?;
    tracing::info!(
        queue = %broker.queue,
        prefetch = broker.prefetch_count,
        base_dir = %app.base_dir.display(),
        "Loaded worker configuration"
    );

    // --- Broker ---
    let connector = BrokerConnector::new(Arc::new(AmqpTransport::new(&broker.url)), broker.clone());
    let publisher = Publisher::new(Arc::clone(&connector)).await;
    let handler = ProcessingHandler::new(
        ProcessorRunner::new(worker),
        publisher,
        broker.result_queue.clone(),
    );
    let _consumer =
        Consumer::start_consuming(Arc::clone(&connector), &broker.queue, Arc::new(handler), false)
            .await;
    connector.start();

    tokio::select! {
        () = shutdown_signal() => {
            connector.stop().await;
            tracing::info!("Worker stopped");
            Ok(())
        }
        stopped = connector.wait_stopped() => {
            stopped.context("Broker connection lost for good")
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
