use std::fmt;

use thiserror::Error;

/// What a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Thread,
    Post,
    Comment,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Thread => write!(f, "thread"),
            Resource::Post => write!(f, "post"),
            Resource::Comment => write!(f, "comment"),
        }
    }
}

/// Failure reported by a collaborator (backend or push transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("rejected by backend: {0}")]
    Validation(String),
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: String },
}

/// Error kinds surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("{0}")]
    Validation(String),
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: String },
    #[error("push channel down: {0}")]
    ChannelDown(String),
    #[error("sync engine stopped")]
    Stopped,
}

impl SyncError {
    pub fn is_not_found(&self, resource: Resource) -> bool {
        matches!(self, SyncError::NotFound { resource: r, .. } if *r == resource)
    }
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => SyncError::TransientNetwork(msg),
            BackendError::Validation(msg) => SyncError::Validation(msg),
            BackendError::NotFound { resource, id } => SyncError::NotFound { resource, id },
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
