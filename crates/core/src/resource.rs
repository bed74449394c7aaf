//! Addressable resources: workspaces and workflows.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ResourceId;

/// Resource category; doubles as the directory name under the data root
/// and as the URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Workspace,
    Workflow,
}

impl ResourceCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource that currently exists on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    pub category: ResourceCategory,
    /// Local directory backing the resource.
    pub path: PathBuf,
    /// Public locator, e.g. `http://localhost:8000/workspace/{id}`.
    pub url: String,
}
