//! Persisted records.

pub mod job;
pub mod workflow;
pub mod workspace;

pub use job::WorkflowJobRecord;
pub use workflow::WorkflowRecord;
pub use workspace::WorkspaceRecord;
