use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use strand_types::models::{UserId, UserRef};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("session format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Identity and carry-over state for one signed-in session.
///
/// Loaded once at session start and handed to the coordinator by value; the
/// coordinator hands it back from `stop()` so it can be saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub user: UserRef,
    #[serde(default)]
    pub bell_count: i64,
    #[serde(default)]
    pub last_active_peer: Option<UserId>,
}

impl SessionContext {
    pub fn new(user: UserRef) -> Self {
        Self {
            user,
            bell_count: 0,
            last_active_peer: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path)?;
        let session: SessionContext = serde_json::from_str(&raw)?;
        info!("Session for {} loaded from {}", session.user.id, path.display());
        Ok(session)
    }

    /// Write atomically: a temp file next to `path`, then rename over it.
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        info!("Session for {} saved to {}", self.user.id, path.display());
        Ok(())
    }
}
