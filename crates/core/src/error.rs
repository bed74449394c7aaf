//! Domain error taxonomy shared by every crate in the workspace.
//!
//! The calling layer owns the mapping of these variants onto transport
//! status codes; nothing in this workspace encodes such codes itself.

use crate::resource::ResourceCategory;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A caller-supplied id is already taken within its category.
    #[error("Resource conflict: {category} with id {id} already exists")]
    ResourceConflict {
        category: ResourceCategory,
        id: String,
    },

    #[error("Resource not found: {category} with id {id}")]
    NotFound {
        category: ResourceCategory,
        id: String,
    },

    /// The resource existed once and was deliberately deleted (tombstoned).
    #[error("Resource gone: {category} with id {id} was deleted")]
    Gone {
        category: ResourceCategory,
        id: String,
    },

    /// The packager rejected the payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The engine could not be started or the broker publish failed.
    #[error("Job dispatch failed: {0}")]
    JobDispatch(String),

    /// Reconnect attempts to the message broker were exhausted.
    #[error("Broker connection failed: {0}")]
    BrokerConnection(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(category: ResourceCategory, id: impl Into<String>) -> Self {
        Self::NotFound {
            category,
            id: id.into(),
        }
    }

    pub fn gone(category: ResourceCategory, id: impl Into<String>) -> Self {
        Self::Gone {
            category,
            id: id.into(),
        }
    }

    pub fn conflict(category: ResourceCategory, id: impl Into<String>) -> Self {
        Self::ResourceConflict {
            category,
            id: id.into(),
        }
    }
}
