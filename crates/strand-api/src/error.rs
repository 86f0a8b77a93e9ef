use strand_sync::error::{BackendError, Resource};

/// Failure of a single HTTP exchange, before it is classified for the engine.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("decode: {0}")]
    Decode(String),
}

/// The entity a request addresses, so a 404 can name what vanished.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub resource: Resource,
    pub id: &'a str,
}

impl<'a> Target<'a> {
    pub fn new(resource: Resource, id: &'a str) -> Self {
        Self { resource, id }
    }
}

impl ApiError {
    /// Classify into the engine's error taxonomy. Without a target, a 404 is
    /// treated like any other unexpected status.
    pub fn into_backend(self, target: Option<Target<'_>>) -> BackendError {
        match self {
            ApiError::Server { status: 400 | 409 | 422, message } => {
                BackendError::Validation(message)
            }
            ApiError::Server { status: 404, message } => match target {
                Some(t) => BackendError::NotFound {
                    resource: t.resource,
                    id: t.id.to_string(),
                },
                None => BackendError::Transient(format!("HTTP 404: {}", message)),
            },
            other => BackendError::Transient(other.to_string()),
        }
    }
}
