//! Spawning the engine child process.
//!
//! Output is not captured in memory: stdout and stderr go straight to files
//! in the job directory so they survive this process and can be inspected
//! while the job runs.

use std::fs::File;
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::engine::EngineCommand;
use super::ExecutionError;

/// Spawn `command` with its working directory set to the job directory and
/// its output redirected to the job's log files.
pub fn spawn_engine(command: &EngineCommand) -> Result<Child, ExecutionError> {
    let stdout = File::create(command.stdout_path())?;
    let stderr = File::create(command.stderr_path())?;

    let mut cmd = Command::new(&command.program);
    cmd.args(command.args())
        .current_dir(&command.job_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    cmd.spawn().map_err(|source| ExecutionError::Spawn {
        program: command.program.clone(),
        source,
    })
}

/// Run `program args...` to completion and return its stdout and stderr
/// concatenated.
pub async fn capture_output(program: &str, args: &[String]) -> Result<String, ExecutionError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ExecutionError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}
