use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use strand_api::HttpBackend;
use strand_gateway::WsTransport;
use strand_sync::{SessionContext, SyncConfig, SyncCoordinator, SyncUpdate};
use strand_types::models::UserRef;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strand=debug".into()),
        )
        .init();

    let api_url =
        std::env::var("STRAND_API_URL").unwrap_or_else(|_| "http://localhost:5000/api".into());
    let gateway_url =
        std::env::var("STRAND_GATEWAY_URL").unwrap_or_else(|_| "ws://localhost:5000/gateway".into());
    let session_path = PathBuf::from(
        std::env::var("STRAND_SESSION_PATH").unwrap_or_else(|_| "strand-session.json".into()),
    );

    let config = SyncConfig::from_env().context("invalid STRAND_* configuration")?;
    let session = load_session(&session_path)?;
    info!(
        "Starting sync for {} against {} (push {})",
        session.user.id, api_url, gateway_url
    );

    let backend = Arc::new(HttpBackend::new(&api_url).context("building HTTP client")?);
    let transport = Arc::new(WsTransport::from_config(&gateway_url, &config));
    let engine = SyncCoordinator::start(session, backend, transport, config).await;

    let mut updates = engine.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => report(&engine, update).await,
                Err(RecvError::Lagged(n)) => warn!("Update stream lagged by {} updates", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let session = engine.stop().await;
    session
        .save(&session_path)
        .with_context(|| format!("saving session to {}", session_path.display()))?;
    Ok(())
}

/// Resume the saved session, or start a fresh one for the user named in
/// `STRAND_USER_ID` / `STRAND_USER_NAME`.
fn load_session(path: &Path) -> anyhow::Result<SessionContext> {
    if path.exists() {
        return SessionContext::load(path)
            .with_context(|| format!("loading session from {}", path.display()));
    }
    let id = std::env::var("STRAND_USER_ID")
        .context("no saved session and STRAND_USER_ID is not set")?;
    let name = std::env::var("STRAND_USER_NAME").unwrap_or_else(|_| id.clone());
    info!("No session at {}, starting fresh as {}", path.display(), id);
    Ok(SessionContext::new(UserRef::new(id, name)))
}

async fn report(engine: &SyncCoordinator, update: SyncUpdate) {
    match update {
        SyncUpdate::ThreadsChanged => {
            let threads = engine.threads().await;
            let pending = threads.iter().filter(|t| t.has_unseen).count();
            info!("{} threads ({} with unseen messages)", threads.len(), pending);
        }
        SyncUpdate::ActiveThreadChanged { peer } => info!("Active thread is now with {}", peer),
        SyncUpdate::MessagesChanged { peer } => {
            if let Some(thread) = engine.active_thread().await.filter(|t| t.peer.id == peer) {
                if let Some(last) = thread.messages.last() {
                    info!("[{}] {}: {}", thread.peer.display_name, last.sender_id, last.body);
                }
            } else {
                debug!("Messages changed in background thread with {}", peer);
            }
        }
        SyncUpdate::FeedChanged { query } => {
            match engine.feed_items(&query).await {
                Ok(items) => info!("Feed {:?} holds {} posts", query, items.len()),
                Err(e) => debug!("Feed {:?} unavailable: {}", query, e),
            }
        }
        SyncUpdate::BellCount { total } => info!("Bell: {}", total),
        SyncUpdate::StatusChanged(status) => info!("Status: {:?}", status),
        SyncUpdate::Autoscroll { .. } | SyncUpdate::ItemEnriched { .. } => {}
    }
}
