//! Query functions, one repository struct per table.

pub mod job_repo;
pub mod workflow_repo;
pub mod workspace_repo;

pub use job_repo::WorkflowJobRepo;
pub use workflow_repo::WorkflowRepo;
pub use workspace_repo::WorkspaceRepo;
