//! Workflow engine invocation shape and sentinel polling.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::packaging::DEFAULT_METS_NAME;

/// Default engine executable.
pub const DEFAULT_ENGINE: &str = "nextflow";

/// File the engine writes into the job directory once it has finished.
pub const DEFAULT_SENTINEL: &str = "report.html";

/// Default input file group handed to the workflow.
pub const DEFAULT_INPUT_GROUP: &str = "OCR-D-IMG";

/// Child stdout is redirected here, relative to the job directory.
pub const STDOUT_FILE: &str = "nextflow_out.txt";

/// Child stderr is redirected here, relative to the job directory.
pub const STDERR_FILE: &str = "nextflow_err.txt";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)version\s+([\d.]+\d)").expect("valid regex"));

/// Engine settings shared by every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Executable name or path.
    pub program: String,
    /// Arguments placed before `run`, e.g. a wrapper script.
    pub program_args: Vec<String>,
    /// Sentinel file name; its presence in the job dir marks completion.
    pub sentinel_name: String,
    pub mets_name: String,
    pub input_group: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENGINE.into(),
            program_args: Vec::new(),
            sentinel_name: DEFAULT_SENTINEL.into(),
            mets_name: DEFAULT_METS_NAME.into(),
            input_group: DEFAULT_INPUT_GROUP.into(),
        }
    }
}

/// Per-job overrides of [`EngineConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub mets_name: Option<String>,
    pub input_group: Option<String>,
}

/// A fully resolved engine invocation:
///
/// ```text
/// <engine> run <script> --workspace <ws>/ --mets <ws>/<mets>
///          --input_group <group> -with-report <job_dir>/<sentinel>
/// ```
///
/// executed with the job directory as working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub program_args: Vec<String>,
    pub script: PathBuf,
    pub workspace_dir: PathBuf,
    pub mets_path: PathBuf,
    pub input_group: String,
    pub report_path: PathBuf,
    pub job_dir: PathBuf,
}

impl EngineCommand {
    pub fn new(
        config: &EngineConfig,
        script: &Path,
        workspace_dir: &Path,
        job_dir: &Path,
        params: &JobParams,
    ) -> Self {
        let mets_name = params.mets_name.as_deref().unwrap_or(&config.mets_name);
        let input_group = params
            .input_group
            .clone()
            .unwrap_or_else(|| config.input_group.clone());
        Self {
            program: config.program.clone(),
            program_args: config.program_args.clone(),
            script: script.to_path_buf(),
            workspace_dir: workspace_dir.to_path_buf(),
            mets_path: workspace_dir.join(mets_name),
            input_group,
            report_path: job_dir.join(&config.sentinel_name),
            job_dir: job_dir.to_path_buf(),
        }
    }

    /// Arguments following the program name.
    pub fn args(&self) -> Vec<OsString> {
        let mut workspace = self.workspace_dir.clone().into_os_string();
        workspace.push("/");

        let mut args: Vec<OsString> = self.program_args.iter().map(OsString::from).collect();
        args.extend([
            "run".into(),
            self.script.clone().into_os_string(),
            "--workspace".into(),
            workspace,
            "--mets".into(),
            self.mets_path.clone().into_os_string(),
            "--input_group".into(),
            self.input_group.clone().into(),
            "-with-report".into(),
            self.report_path.clone().into_os_string(),
        ]);
        args
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.job_dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.job_dir.join(STDERR_FILE)
    }
}

/// Sentinel poll: `true` once `<job_dir>/<sentinel>` exists.
pub fn sentinel_present(job_dir: &Path, sentinel_name: &str) -> bool {
    job_dir.join(sentinel_name).is_file()
}

/// Extract the version number from engine `-v` output.
pub fn parse_engine_version(output: &str) -> Option<String> {
    VERSION_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_has_fixed_shape() {
        let cmd = EngineCommand::new(
            &EngineConfig::default(),
            Path::new("/data/workflow/wf/main.nf"),
            Path::new("/data/workspace/ws"),
            Path::new("/data/workflow/wf/job"),
            &JobParams::default(),
        );
        let args: Vec<String> = cmd
            .args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "run",
                "/data/workflow/wf/main.nf",
                "--workspace",
                "/data/workspace/ws/",
                "--mets",
                "/data/workspace/ws/mets.xml",
                "--input_group",
                "OCR-D-IMG",
                "-with-report",
                "/data/workflow/wf/job/report.html",
            ]
        );
        assert_eq!(cmd.program, "nextflow");
        assert_eq!(cmd.stdout_path(), Path::new("/data/workflow/wf/job/nextflow_out.txt"));
    }

    #[test]
    fn params_override_defaults() {
        let params = JobParams {
            mets_name: Some("other.xml".into()),
            input_group: Some("OCR-D-GT".into()),
        };
        let cmd = EngineCommand::new(
            &EngineConfig::default(),
            Path::new("s.nf"),
            Path::new("/ws"),
            Path::new("/job"),
            &params,
        );
        assert_eq!(cmd.mets_path, Path::new("/ws/other.xml"));
        assert_eq!(cmd.input_group, "OCR-D-GT");
    }

    #[test]
    fn program_args_precede_run() {
        let config = EngineConfig {
            program: "sh".into(),
            program_args: vec!["/opt/fake-engine.sh".into()],
            ..EngineConfig::default()
        };
        let cmd = EngineCommand::new(
            &config,
            Path::new("s.nf"),
            Path::new("/ws"),
            Path::new("/job"),
            &JobParams::default(),
        );
        let args = cmd.args();
        assert_eq!(args[0], "/opt/fake-engine.sh");
        assert_eq!(args[1], "run");
    }

    #[test]
    fn version_is_parsed() {
        let out = "\n      N E X T F L O W\n      version 23.04.1 build 5866\n";
        assert_eq!(parse_engine_version(out).as_deref(), Some("23.04.1"));
        assert_eq!(
            parse_engine_version("nextflow version 22.10.0.5826").as_deref(),
            Some("22.10.0.5826")
        );
        assert_eq!(parse_engine_version("command not found"), None);
    }

    #[test]
    fn sentinel_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!sentinel_present(dir.path(), DEFAULT_SENTINEL));
        std::fs::write(dir.path().join(DEFAULT_SENTINEL), "<html/>").unwrap();
        assert!(sentinel_present(dir.path(), DEFAULT_SENTINEL));
    }
}
