//! Local engine executor.
//!
//! [`LocalExecutor::spawn`] starts the engine and returns a
//! [`RunningEngine`]; awaiting [`RunningEngine::wait`] blocks until the child
//! exits. The split lets callers record the job as RUNNING in between.
//! There is no timeout and no kill API: a job runs until the engine exits.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::process::Child;

use super::engine::{self, EngineCommand, EngineConfig, JobParams};
use super::subprocess;
use crate::error::CoreError;

/// Errors from starting or waiting on the engine.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine exited unsuccessfully. `None` means killed by a signal.
    #[error("Engine exited with status {}", describe_status(.exit_code))]
    Failed { exit_code: Option<i32> },

    #[error("Could not determine engine version from output: {0}")]
    VersionUnparsable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_status(exit_code: &Option<i32>) -> String {
    exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

impl From<ExecutionError> for CoreError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Io(e) => CoreError::Io(e),
            ExecutionError::VersionUnparsable(_) => CoreError::Internal(err.to_string()),
            other => CoreError::JobDispatch(other.to_string()),
        }
    }
}

/// Outcome of an engine run that exited with status 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    /// Whether the sentinel was present when the child exited.
    pub finished: bool,
    pub duration_ms: u64,
}

/// A spawned engine child.
#[derive(Debug)]
pub struct RunningEngine {
    child: Child,
    job_dir: PathBuf,
    sentinel_name: String,
    started: Instant,
}

impl RunningEngine {
    /// OS process id, if the child has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Wait for the child to exit.
    pub async fn wait(mut self) -> Result<EngineExit, ExecutionError> {
        let status = self.child.wait().await?;
        let duration_ms = self.started.elapsed().as_millis() as u64;

        if !status.success() {
            tracing::warn!(
                job_dir = %self.job_dir.display(),
                exit_code = ?status.code(),
                duration_ms,
                "Engine exited unsuccessfully"
            );
            return Err(ExecutionError::Failed {
                exit_code: status.code(),
            });
        }

        let finished = engine::sentinel_present(&self.job_dir, &self.sentinel_name);
        tracing::info!(
            job_dir = %self.job_dir.display(),
            finished,
            duration_ms,
            "Engine exited"
        );
        Ok(EngineExit {
            finished,
            duration_ms,
        })
    }
}

/// Runs workflow scripts through the configured engine as local children.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    config: EngineConfig,
}

impl LocalExecutor {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the engine for one job. The job directory must exist.
    pub fn spawn(
        &self,
        script: &Path,
        workspace_dir: &Path,
        job_dir: &Path,
        params: &JobParams,
    ) -> Result<RunningEngine, ExecutionError> {
        let command = EngineCommand::new(&self.config, script, workspace_dir, job_dir, params);
        let child = subprocess::spawn_engine(&command)?;
        tracing::info!(
            program = %command.program,
            script = %script.display(),
            job_dir = %job_dir.display(),
            pid = ?child.id(),
            "Started engine"
        );
        Ok(RunningEngine {
            child,
            job_dir: job_dir.to_path_buf(),
            sentinel_name: self.config.sentinel_name.clone(),
            started: Instant::now(),
        })
    }

    /// Start the engine and wait for it to exit.
    pub async fn execute(
        &self,
        script: &Path,
        workspace_dir: &Path,
        job_dir: &Path,
        params: &JobParams,
    ) -> Result<EngineExit, ExecutionError> {
        self.spawn(script, workspace_dir, job_dir, params)?.wait().await
    }

    /// Whether the sentinel for the job in `job_dir` exists.
    pub fn is_finished(&self, job_dir: &Path) -> bool {
        engine::sentinel_present(job_dir, &self.config.sentinel_name)
    }

    /// Version reported by `<engine> -v`.
    pub async fn engine_version(&self) -> Result<String, ExecutionError> {
        let mut args = self.config.program_args.clone();
        args.push("-v".into());
        let output = subprocess::capture_output(&self.config.program, &args).await?;
        engine::parse_engine_version(&output)
            .ok_or_else(|| ExecutionError::VersionUnparsable(output.trim().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// An executor whose "engine" is `sh <tmp>/engine.sh`.
    ///
    /// Positional arguments seen by the script: `$1` = run, `$2` = script,
    /// `$4` = workspace, `$6` = mets, `$8` = input group, `$10` = report path.
    fn fake_engine(dir: &Path, body: &str) -> LocalExecutor {
        let script = dir.join("engine.sh");
        std::fs::write(&script, body).expect("write engine script");
        LocalExecutor::new(EngineConfig {
            program: "sh".into(),
            program_args: vec![script.to_string_lossy().into_owned()],
            ..EngineConfig::default()
        })
    }

    fn job_layout(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let script = dir.join("main.nf");
        let workspace = dir.join("ws");
        let job = dir.join("job");
        std::fs::write(&script, "workflow {}").unwrap();
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::create_dir_all(&job).unwrap();
        (script, workspace, job)
    }

    #[tokio::test]
    async fn successful_run_writes_sentinel_and_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = fake_engine(
            tmp.path(),
            "echo \"$@\"\npwd > cwd.txt\necho done > \"${10}\"\n",
        );
        let (script, workspace, job) = job_layout(tmp.path());

        let exit = executor
            .execute(&script, &workspace, &job, &JobParams::default())
            .await
            .expect("execute");
        assert!(exit.finished);
        assert!(executor.is_finished(&job));

        let stdout = std::fs::read_to_string(job.join(engine::STDOUT_FILE)).unwrap();
        assert!(stdout.contains("--input_group OCR-D-IMG"));
        assert!(job.join(engine::STDERR_FILE).is_file());
        let cwd = std::fs::read_to_string(job.join("cwd.txt")).unwrap();
        assert_eq!(
            Path::new(cwd.trim()).canonicalize().unwrap(),
            job.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn clean_exit_without_sentinel_is_unfinished() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = fake_engine(tmp.path(), "exit 0\n");
        let (script, workspace, job) = job_layout(tmp.path());

        let exit = executor
            .execute(&script, &workspace, &job, &JobParams::default())
            .await
            .expect("execute");
        assert!(!exit.finished);
        assert!(!executor.is_finished(&job));
    }

    #[tokio::test]
    async fn nonzero_exit_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = fake_engine(tmp.path(), "echo boom >&2\nexit 3\n");
        let (script, workspace, job) = job_layout(tmp.path());

        let result = executor
            .execute(&script, &workspace, &job, &JobParams::default())
            .await;
        assert_matches!(result, Err(ExecutionError::Failed { exit_code: Some(3) }));
        let stderr = std::fs::read_to_string(job.join(engine::STDERR_FILE)).unwrap();
        assert!(stderr.contains("boom"));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(EngineConfig {
            program: "/nonexistent/engine-binary".into(),
            ..EngineConfig::default()
        });
        let (script, workspace, job) = job_layout(tmp.path());

        let err = executor
            .spawn(&script, &workspace, &job, &JobParams::default())
            .unwrap_err();
        assert_matches!(err, ExecutionError::Spawn { .. });
        assert_matches!(CoreError::from(err), CoreError::JobDispatch(_));
    }

    #[tokio::test]
    async fn engine_version_parses_output() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = fake_engine(tmp.path(), "echo \"nextflow version 23.04.1.5866\"\n");
        assert_eq!(executor.engine_version().await.unwrap(), "23.04.1.5866");

        let silent = fake_engine(tmp.path(), "echo nothing here\n");
        assert_matches!(
            silent.engine_version().await,
            Err(ExecutionError::VersionUnparsable(_))
        );
    }

    #[test]
    fn failed_display_handles_signal() {
        assert_eq!(
            ExecutionError::Failed { exit_code: Some(2) }.to_string(),
            "Engine exited with status 2"
        );
        assert_eq!(
            ExecutionError::Failed { exit_code: None }.to_string(),
            "Engine exited with status signal"
        );
    }
}
