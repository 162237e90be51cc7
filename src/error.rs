//! Domain errors surfaced to API clients.
//!
//! Database and service functions return `anyhow::Result`; when a failure is
//! something the caller can act on, the underlying error is a [`TcoError`]
//! and the HTTP layer maps it to a status code by downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcoError {
    /// Input rejected before touching the store.
    #[error("{0}")]
    Validation(String),

    /// A uniqueness rule would be violated (duplicate name, second recurring invoice).
    #[error("{0}")]
    Conflict(String),

    /// Delete refused because other rows still reference the entity.
    #[error("{entity} is still referenced by {relation}")]
    InUse { entity: String, relation: String },

    #[error("{0} not found")]
    NotFound(String),

    /// An uploaded file could not be read as a workbook or with any supported
    /// encoding and separator.
    #[error("{message} (attempted: {})", .attempts.join("; "))]
    Parse {
        message: String,
        attempts: Vec<String>,
    },
}

impl TcoError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn in_use(entity: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::InUse {
            entity: entity.into(),
            relation: relation.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
