//! Client-side synchronization engine for a social feed and direct chat.
//!
//! Merges a push channel and periodic polls into de-duplicated, ordered
//! stores that a UI layer reads and subscribes to.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod feed;
pub mod poll;
pub mod push;
pub mod scroll;
pub mod session;
pub mod status;
pub mod tasks;
pub mod threads;

pub use backend::{Backend, PushLink, PushTransport};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{BackendError, Resource, SyncError, SyncResult};
pub use feed::{FeedStore, PageCursor, PageOutcome};
pub use scroll::{ScrollPolicy, Viewport};
pub use session::{SessionContext, SessionError};
pub use status::{SyncStatus, SyncUpdate};
pub use threads::{HistoryOutcome, InboundOutcome, SendReceipt, ThreadStore};
