//! Worker settings.

use std::path::PathBuf;

use ocrd_core::config::AppConfig;
use ocrd_core::error::CoreError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Data root shared with the API; used to resolve workspace ids.
    pub base_dir: PathBuf,
    pub mets_name: String,
    /// Directory holding the processor executables. `None` resolves them
    /// through `PATH`.
    pub processor_dir: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load the worker settings on top of an [`AppConfig`].
    ///
    /// | Env Var                        | Default           |
    /// |--------------------------------|-------------------|
    /// | `OCRD_WEBAPI_PROCESSOR_DIR`    | unset (`PATH`)    |
    pub fn from_env(app: &AppConfig) -> Result<Self, CoreError> {
        Self::from_lookup(app, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        app: &AppConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let processor_dir = lookup("OCRD_WEBAPI_PROCESSOR_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        if let Some(dir) = &processor_dir {
            if dir.is_relative() {
                return Err(CoreError::Config(format!(
                    "OCRD_WEBAPI_PROCESSOR_DIR must be an absolute path, got '{}'",
                    dir.display()
                )));
            }
        }
        Ok(Self {
            base_dir: app.base_dir.clone(),
            mets_name: app.engine.mets_name.clone(),
            processor_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn app() -> AppConfig {
        AppConfig::from_lookup(|_| None).unwrap()
    }

    #[test]
    fn defaults_follow_app_config() {
        let config = WorkerConfig::from_lookup(&app(), |_| None).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/tmp/ocrd-webapi-data"));
        assert_eq!(config.mets_name, "mets.xml");
        assert!(config.processor_dir.is_none());
    }

    #[test]
    fn processor_dir_must_be_absolute() {
        let config = WorkerConfig::from_lookup(&app(), |_| Some("/opt/ocrd/bin".into())).unwrap();
        assert_eq!(config.processor_dir, Some(PathBuf::from("/opt/ocrd/bin")));
        assert_matches!(
            WorkerConfig::from_lookup(&app(), |_| Some("bin".into())),
            Err(CoreError::Config(_))
        );
    }
}
