use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use strand_sync::backend::{PushLink, PushTransport};
use strand_sync::config::SyncConfig;
use strand_sync::error::BackendError;

use crate::connection::run_connection_loop;

const LINK_BUFFER: usize = 256;

/// Connects to the push gateway at a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    heartbeat: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_config(url, &SyncConfig::default())
    }

    pub fn from_config(url: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            url: url.into(),
            heartbeat: config.heartbeat_interval,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self) -> Result<PushLink, BackendError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| BackendError::Transient(format!("gateway connect failed: {}", e)))?;
        debug!(url = %self.url, "Gateway socket open");

        let (event_tx, event_rx) = mpsc::channel(LINK_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(LINK_BUFFER);
        tokio::spawn(run_connection_loop(socket, event_tx, command_rx, self.heartbeat));

        Ok(PushLink {
            events: event_rx,
            commands: command_tx,
        })
    }
}
