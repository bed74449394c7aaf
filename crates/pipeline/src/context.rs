//! Process-wide application context.
//!
//! Built once at startup and passed by reference. Owns the single instance
//! of every store and lifecycle so that helpers never construct their own.

use std::sync::Arc;

use ocrd_broker::{BrokerConfig, BrokerConnector, Consumer, Publisher};
use ocrd_core::config::AppConfig;
use ocrd_core::error::CoreError;
use ocrd_core::execution::LocalExecutor;
use ocrd_core::packaging::{BagItZipPackager, Packager};
use ocrd_core::resource::ResourceCategory;
use ocrd_core::resource_store::ResourceStore;
use ocrd_db::{InMemoryStore, PgStore, RecordStore};

use crate::completion::CompletionRegistry;
use crate::dispatch::{BrokerJobRunner, ResultListener};
use crate::runner::{JobRunner, LocalJobRunner};
use crate::workflow::WorkflowLifecycle;
use crate::workspace::WorkspaceLifecycle;

/// Where jobs execute.
pub enum Execution {
    /// Engine children on this host.
    Local,
    /// Processing messages over a started or not yet started connector.
    Broker(Arc<BrokerConnector>),
}

/// Broker-side handles kept alive for the lifetime of the context.
struct BrokerHandles {
    connector: Arc<BrokerConnector>,
    _results: Consumer,
}

pub struct AppContext {
    pub config: AppConfig,
    pub records: Arc<dyn RecordStore>,
    pub completions: Arc<CompletionRegistry>,
    pub workspaces: WorkspaceLifecycle,
    pub workflows: WorkflowLifecycle,
    broker: Option<BrokerHandles>,
}

impl AppContext {
    /// Open the resource stores under `config.base_dir` and wire the
    /// lifecycles to the chosen execution path.
    pub async fn build(
        config: AppConfig,
        records: Arc<dyn RecordStore>,
        execution: Execution,
    ) -> Result<Self, CoreError> {
        let workspace_store = Arc::new(
            ResourceStore::open(ResourceCategory::Workspace, &config.base_dir, &config.server_url)
                .await?,
        );
        let workflow_store = Arc::new(
            ResourceStore::open(ResourceCategory::Workflow, &config.base_dir, &config.server_url)
                .await?,
        );
        let completions = Arc::new(CompletionRegistry::new());
        let packager: Arc<dyn Packager> = Arc::new(BagItZipPackager);

        let (runner, broker): (Arc<dyn JobRunner>, Option<BrokerHandles>) = match execution {
            Execution::Local => {
                tracing::info!(
                    engine = %config.engine.program,
                    "Jobs run as local engine children"
                );
                let runner = LocalJobRunner::new(
                    LocalExecutor::new(config.engine.clone()),
                    Arc::clone(&records),
                    Arc::clone(&completions),
                );
                (Arc::new(runner), None)
            }
            Execution::Broker(connector) => {
                let broker_config: BrokerConfig = connector.config().clone();
                tracing::info!(
                    queue = %broker_config.queue,
                    result_queue = %broker_config.result_queue,
                    "Jobs are dispatched through the broker"
                );
                let publisher = Publisher::new(Arc::clone(&connector)).await;
                let results = ResultListener::start(
                    Arc::clone(&connector),
                    &broker_config.result_queue,
                    Arc::clone(&records),
                    Arc::clone(&completions),
                )
                .await;
                let runner = BrokerJobRunner::new(publisher, &broker_config, &config.engine);
                (
                    Arc::new(runner),
                    Some(BrokerHandles {
                        connector,
                        _results: results,
                    }),
                )
            }
        };

        Ok(Self {
            workspaces: WorkspaceLifecycle::new(
                Arc::clone(&workspace_store),
                Arc::clone(&records),
                packager,
            ),
            workflows: WorkflowLifecycle::new(
                workflow_store,
                workspace_store,
                Arc::clone(&records),
                runner,
                Arc::clone(&completions),
            ),
            config,
            records,
            completions,
            broker,
        })
    }

    /// The record store selected by `config`: PostgreSQL when a database
    /// URL is set, in-memory otherwise.
    pub async fn open_records(config: &AppConfig) -> Result<Arc<dyn RecordStore>, CoreError> {
        let Some(url) = config.database_url.as_deref() else {
            tracing::warn!("No database configured, records are kept in memory");
            return Ok(Arc::new(InMemoryStore::new()));
        };
        let pool = ocrd_db::create_pool(url)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        ocrd_db::health_check(&pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        ocrd_db::run_migrations(&pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        tracing::info!("Database ready");
        Ok(Arc::new(PgStore::new(pool)))
    }

    pub fn broker(&self) -> Option<&Arc<BrokerConnector>> {
        self.broker.as_ref().map(|b| &b.connector)
    }

    /// Stop the broker connection; stopping cancels the result
    /// subscription before the connection closes.
    pub async fn shutdown(self) {
        if let Some(broker) = self.broker {
            broker.connector.stop().await;
        }
        let pending = self.completions.pending();
        if pending > 0 {
            tracing::warn!(pending, "Shutting down with unfinished jobs");
        }
        tracing::info!("Application context shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ocrd_db::models::WorkflowJobRecord;

    use super::*;

    fn config() -> AppConfig {
        AppConfig::from_lookup(|_| None).unwrap()
    }

    #[tokio::test]
    async fn records_stay_in_memory_without_database() {
        let records = AppContext::open_records(&config()).await.unwrap();
        records
            .save_job(&WorkflowJobRecord::queued("job-1", "wf-1", "ws-1"))
            .await
            .unwrap();
        assert!(records.get_job("job-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unusable_database_url_is_a_storage_error() {
        let mut config = config();
        config.database_url = Some("not a database url".into());
        let result = AppContext::open_records(&config).await.map(|_| ());
        assert_matches!(result, Err(CoreError::Storage(_)));
    }
}
