use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MessageId, ThreadId, UserId};

/// Events received FROM the push gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushEvent {
    /// A chat message was posted to a thread the user takes part in
    MessageCreate {
        #[serde(default)]
        id: Option<MessageId>,
        thread_id: ThreadId,
        sender_id: UserId,
        body: String,
        timestamp: DateTime<Utc>,
    },

    /// The user's thread list changed server-side (new thread, new recency order)
    ThreadListUpdate { user_id: UserId },

    /// Increment for the notification bell
    BellCount { count: i64 },
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageCreate { .. } => EventKind::Message,
            Self::ThreadListUpdate { .. } => EventKind::ThreadList,
            Self::BellCount { .. } => EventKind::Bell,
        }
    }
}

/// Event families a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ThreadList,
    Bell,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Message, EventKind::ThreadList, EventKind::Bell];
}

/// Commands sent FROM the client TO the push gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushCommand {
    /// Bind the connection to a user
    Identify { user_id: UserId },

    /// Subscribe to event families. Re-sent after every reconnection.
    Subscribe { kinds: Vec<EventKind> },

    /// Bump another user's notification bell (e.g. after liking their post)
    SendBell { target_user_id: UserId, count: i64 },
}
