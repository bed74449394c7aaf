//! Process-wide configuration loaded from environment variables.

use std::path::PathBuf;

use crate::error::CoreError;
use crate::execution::EngineConfig;

/// Default data root.
pub const DEFAULT_BASE_DIR: &str = "/tmp/ocrd-webapi-data";

/// Default public server locator used to build resource URLs.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Application configuration.
///
/// Built once in `main` and handed to the components that need it.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Data root; resources live under `<base_dir>/<category>/<id>`.
    pub base_dir: PathBuf,
    /// Public server locator, without trailing slash.
    pub server_url: String,
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Workflow engine invocation settings.
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                   |
    /// |--------------------------------|---------------------------|
    /// | `OCRD_WEBAPI_BASE_DIR`         | `/tmp/ocrd-webapi-data`   |
    /// | `OCRD_WEBAPI_SERVER_URL`       | `http://localhost:8000`   |
    /// | `OCRD_WEBAPI_DATABASE_URL`     | unset (in-memory store)   |
    /// | `OCRD_WEBAPI_ENGINE`           | `nextflow`                |
    /// | `OCRD_WEBAPI_SENTINEL`         | `report.html`             |
    /// | `OCRD_WEBAPI_METS_NAME`        | `mets.xml`                |
    /// | `OCRD_WEBAPI_INPUT_GROUP`      | `OCR-D-IMG`               |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_dir = PathBuf::from(
            non_empty("OCRD_WEBAPI_BASE_DIR").unwrap_or_else(|| DEFAULT_BASE_DIR.into()),
        );
        if base_dir.is_relative() {
            return Err(CoreError::Config(format!(
                "OCRD_WEBAPI_BASE_DIR must be an absolute path, got '{}'",
                base_dir.display()
            )));
        }

        let server_url = non_empty("OCRD_WEBAPI_SERVER_URL")
            .unwrap_or_else(|| DEFAULT_SERVER_URL.into())
            .trim_end_matches('/')
            .to_string();
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(CoreError::Config(format!(
                "OCRD_WEBAPI_SERVER_URL must be an http(s) URL, got '{server_url}'"
            )));
        }

        let mut engine = EngineConfig::default();
        if let Some(program) = non_empty("OCRD_WEBAPI_ENGINE") {
            engine.program = program;
        }
        if let Some(sentinel) = non_empty("OCRD_WEBAPI_SENTINEL") {
            engine.sentinel_name = sentinel;
        }
        if let Some(mets) = non_empty("OCRD_WEBAPI_METS_NAME") {
            engine.mets_name = mets;
        }
        if let Some(group) = non_empty("OCRD_WEBAPI_INPUT_GROUP") {
            engine.input_group = group;
        }

        Ok(Self {
            base_dir,
            server_url,
            database_url: non_empty("OCRD_WEBAPI_DATABASE_URL"),
            engine,
        })
    }
}
