//! Runs one OCR-D processor for a [`ProcessingMessage`].
//!
//! Invocation shape, executed in the directory holding the METS file:
//!
//! ```text
//! <processor> -m <mets> -I <in,...> [-O <out,...>] [-g <pages>]
//!             [-p <json>] [-l <level>] [--overwrite]
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use ocrd_broker::messages::ProcessingMessage;
use ocrd_core::resource::ResourceCategory;

use crate::config::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Cannot locate METS: {0}")]
    Mets(String),

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Processor exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

/// Characters of stderr kept in a failure report.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct ProcessorRunner {
    config: WorkerConfig,
}

impl ProcessorRunner {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Absolute METS path of the request: `path_to_mets` when given,
    /// otherwise the workspace's METS under the data root.
    pub fn resolve_mets(&self, request: &ProcessingMessage) -> Result<PathBuf, ProcessorError> {
        let mets = match (&request.path_to_mets, &request.workspace_id) {
            (Some(path), _) => PathBuf::from(path),
            (None, Some(workspace_id)) => self
                .config
                .base_dir
                .join(ResourceCategory::Workspace.as_str())
                .join(workspace_id)
                .join(&self.config.mets_name),
            (None, None) => {
                return Err(ProcessorError::Mets(
                    "neither path_to_mets nor workspace_id given".into(),
                ))
            }
        };
        if !mets.is_file() {
            return Err(ProcessorError::Mets(format!("{} does not exist", mets.display())));
        }
        Ok(mets)
    }

    /// Executable for `processor_name`, inside the configured processor
    /// directory when one is set.
    pub fn program(&self, processor_name: &str) -> PathBuf {
        match &self.config.processor_dir {
            Some(dir) => dir.join(processor_name),
            None => PathBuf::from(processor_name),
        }
    }

    /// Run the processor and wait for it.
    pub async fn run(&self, request: &ProcessingMessage) -> Result<(), ProcessorError> {
        let mets = self.resolve_mets(request)?;
        let program = self.program(&request.processor_name);
        let args = arguments(request, &mets);
        let workdir = mets.parent().unwrap_or(Path::new("."));

        tracing::info!(
            job_id = %request.job_id,
            program = %program.display(),
            mets = %mets.display(),
            "Running processor"
        );
        let output = tokio::process::Command::new(&program)
            .args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProcessorError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        if output.status.success() {
            tracing::info!(job_id = %request.job_id, "Processor finished");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map_or(0, |(i, _)| i);
        Err(ProcessorError::Failed {
            code: output.status.code(),
            stderr: stderr[start..].trim().to_string(),
        })
    }
}

/// Command line arguments for `request`.
pub fn arguments(request: &ProcessingMessage, mets: &Path) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        mets.to_string_lossy().into_owned(),
        "-I".to_string(),
        request.input_file_grps.join(","),
    ];
    if !request.output_file_grps.is_empty() {
        args.extend(["-O".to_string(), request.output_file_grps.join(",")]);
    }
    if let Some(page_id) = &request.page_id {
        args.extend(["-g".to_string(), page_id.clone()]);
    }
    if !request.parameters.is_empty() {
        args.extend([
            "-p".to_string(),
            serde_json::Value::Object(request.parameters.clone()).to_string(),
        ]);
    }
    if let Some(level) = &request.log_level {
        args.extend(["-l".to_string(), level.clone()]);
    }
    if request.overwrite {
        args.push("--overwrite".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request() -> ProcessingMessage {
        let mut msg = ProcessingMessage::new("job-1", "ocrd-dummy");
        msg.workspace_id = Some("ws-1".into());
        msg.input_file_grps = vec!["OCR-D-IMG".into(), "OCR-D-SEG".into()];
        msg
    }

    fn runner(base: &Path) -> ProcessorRunner {
        ProcessorRunner::new(WorkerConfig {
            base_dir: base.to_path_buf(),
            mets_name: "mets.xml".into(),
            processor_dir: None,
        })
    }

    #[test]
    fn minimal_arguments() {
        let args = arguments(&request(), Path::new("/data/mets.xml"));
        assert_eq!(args, ["-m", "/data/mets.xml", "-I", "OCR-D-IMG,OCR-D-SEG"]);
    }

    #[test]
    fn optional_arguments() {
        let mut msg = request();
        msg.output_file_grps = vec!["OCR-D-OUT".into()];
        msg.page_id = Some("PHYS_0001".into());
        msg.parameters
            .insert("dpi".into(), serde_json::Value::from(300));
        msg.log_level = Some("DEBUG".into());
        msg.overwrite = true;

        let args = arguments(&msg, Path::new("/m.xml"));
        assert_eq!(
            args,
            [
                "-m", "/m.xml", "-I", "OCR-D-IMG,OCR-D-SEG", "-O", "OCR-D-OUT", "-g", "PHYS_0001",
                "-p", "{\"dpi\":300}", "-l", "DEBUG", "--overwrite",
            ]
        );
    }

    #[test]
    fn mets_resolves_from_workspace_id() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("workspace/ws-1");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("mets.xml"), "<mets/>").unwrap();

        let runner = runner(tmp.path());
        assert_eq!(runner.resolve_mets(&request()).unwrap(), ws.join("mets.xml"));

        let mut missing = request();
        missing.workspace_id = Some("ws-2".into());
        assert_matches!(runner.resolve_mets(&missing), Err(ProcessorError::Mets(_)));
    }

    #[test]
    fn processor_dir_prefixes_program() {
        let mut runner = runner(Path::new("/data"));
        assert_eq!(runner.program("ocrd-dummy"), PathBuf::from("ocrd-dummy"));
        runner.config.processor_dir = Some(PathBuf::from("/opt/ocrd/bin"));
        assert_eq!(
            runner.program("ocrd-dummy"),
            PathBuf::from("/opt/ocrd/bin/ocrd-dummy")
        );
    }
}
