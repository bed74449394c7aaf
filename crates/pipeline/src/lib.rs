//! Workspace and workflow lifecycles plus job orchestration over the
//! local engine or the message broker.

pub mod completion;
pub mod context;
pub mod dispatch;
pub mod runner;
pub mod workflow;
pub mod workspace;

pub use completion::{CompletionRegistry, JobHandle, JobOutcome};
pub use context::{AppContext, Execution};
pub use dispatch::{BrokerJobRunner, ResultListener};
pub use runner::{JobLaunch, JobRunner, LocalJobRunner};
pub use workflow::WorkflowLifecycle;
pub use workspace::WorkspaceLifecycle;
