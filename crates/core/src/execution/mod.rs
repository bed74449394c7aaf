//! Local workflow-engine execution.
//!
//! Pure process management with no persistence access: building the
//! engine command line, spawning the child with its output redirected into
//! the job directory, waiting for exit and polling the completion sentinel.

pub mod engine;
pub mod executor;
pub mod subprocess;

pub use engine::{EngineCommand, EngineConfig, JobParams};
pub use executor::{EngineExit, ExecutionError, LocalExecutor, RunningEngine};
