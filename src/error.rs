//! Error types for freshet.

use thiserror::Error;

use crate::model::BuildState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: BuildState, to: BuildState },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid rule: {0}")]
    Rule(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A collaborator call failed in a way that may succeed if repeated.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure is worth retrying under a [`crate::retry::RetryPolicy`].
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Storage(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
