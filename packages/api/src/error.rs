//! API errors.

use actors::{ActorError, ConfigError, StoreError};
use db::DbError;
use queue_core::JobId;

/// Errors returned to API callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
