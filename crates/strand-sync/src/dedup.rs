//! Identity derivation and bounded replay suppression for inbound events.
//!
//! Retention is bounded twice: by key count and by age. Whichever bound is
//! hit first evicts, oldest first. Perfect suppression under an unbounded
//! backlog is out of reach by construction.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::trace;

use strand_types::models::UserId;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Message,
    Post,
}

impl Namespace {
    fn as_str(self) -> &'static str {
        match self {
            Namespace::Message => "msg",
            Namespace::Post => "post",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn from_id(ns: Namespace, id: &str) -> Self {
        Self(format!("{}:id:{}", ns.as_str(), id))
    }

    /// Content-derived identity for events that carry no server id.
    pub fn composite(
        ns: Namespace,
        scope: &str,
        sender: &str,
        body: &str,
        timestamp: DateTime<Utc>,
        bucket: Duration,
    ) -> Self {
        let digest = digest(&[
            scope,
            sender,
            &normalize_body(body),
            &time_bucket(timestamp, bucket).to_string(),
        ]);
        Self(format!("{}:c:{}", ns.as_str(), digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn anonymous(&self) -> Self {
        Self(format!("{}:anon", self.0))
    }
}

/// Trimmed, whitespace-collapsed, lower-cased.
pub fn normalize_body(body: &str) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn time_bucket(timestamp: DateTime<Utc>, bucket: Duration) -> i64 {
    let width = i64::try_from(bucket.as_millis()).unwrap_or(i64::MAX).max(1);
    timestamp.timestamp_millis().div_euclid(width)
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// All identities of one message event.
///
/// An id-bearing copy and an id-less copy of the same message must collapse,
/// while two distinct id-bearing messages with equal text must not. So the
/// content key is also recorded in an "anonymous" form when the event had no
/// id, and id-bearing events only match against that form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKeys {
    pub id: Option<DedupKey>,
    pub composite: DedupKey,
}

impl MessageKeys {
    fn lookup(&self) -> DedupKey {
        match &self.id {
            Some(id) => id.clone(),
            None => self.composite.clone(),
        }
    }

    fn record_set(&self) -> Vec<DedupKey> {
        match &self.id {
            Some(id) => vec![id.clone(), self.composite.clone()],
            None => vec![self.composite.clone(), self.composite.anonymous()],
        }
    }

    fn seen_in(&self, seen: &HashSet<DedupKey>) -> bool {
        seen.contains(&self.lookup())
            || (self.id.is_some() && seen.contains(&self.composite.anonymous()))
    }
}

/// Pending expectation that an optimistic outbound message will come back.
/// Scoped to the conversation partner, so the same text sent to two peers
/// yields two distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EchoKey(String);

impl EchoKey {
    pub fn new(peer: &UserId, sender: &UserId, body: &str) -> Self {
        Self(digest(&[
            "echo",
            peer.as_str(),
            sender.as_str(),
            &normalize_body(body),
        ]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New,
    Duplicate,
    /// The event is the server copy of a local optimistic message.
    Echo(EchoKey),
}

impl Admission {
    pub fn is_new(&self) -> bool {
        matches!(self, Admission::New)
    }
}

#[derive(Default)]
struct Retention {
    seen: HashSet<DedupKey>,
    order: VecDeque<(DedupKey, Instant)>,
    echoes: VecDeque<(EchoKey, Instant)>,
}

impl Retention {
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some((_, at)) = self.order.front() {
            if now.duration_since(*at) < window {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
        while let Some((_, at)) = self.echoes.front() {
            if now.duration_since(*at) < window {
                break;
            }
            self.echoes.pop_front();
        }
    }

    fn record(&mut self, key: DedupKey, now: Instant, capacity: usize) {
        if self.seen.insert(key.clone()) {
            self.order.push_back((key, now));
        }
        while self.order.len() > capacity {
            if let Some((old, _)) = self.order.pop_front() {
                trace!(key = old.as_str(), "dedup retention full, evicting");
                self.seen.remove(&old);
            }
        }
    }
}

pub struct Deduplicator {
    capacity: usize,
    window: Duration,
    bucket: Duration,
    retention: Mutex<Retention>,
}

impl Deduplicator {
    pub fn new(capacity: usize, window: Duration, bucket: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            bucket,
            retention: Mutex::new(Retention::default()),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.dedup_capacity,
            config.dedup_window,
            config.message_poll_interval,
        )
    }

    pub fn bucket(&self) -> Duration {
        self.bucket
    }

    fn lock(&self) -> MutexGuard<'_, Retention> {
        let mut guard = self.retention.lock().unwrap_or_else(PoisonError::into_inner);
        guard.expire(Instant::now(), self.window);
        guard
    }

    /// True the first time `key` is seen within the retention window.
    pub fn admit(&self, key: &DedupKey) -> bool {
        let mut retention = self.lock();
        if retention.seen.contains(key) {
            return false;
        }
        retention.record(key.clone(), Instant::now(), self.capacity);
        true
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.lock().seen.contains(key)
    }

    pub fn message_keys(
        &self,
        scope: &str,
        server_id: Option<&str>,
        sender: &UserId,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> MessageKeys {
        MessageKeys {
            id: server_id.map(|id| DedupKey::from_id(Namespace::Message, id)),
            composite: DedupKey::composite(
                Namespace::Message,
                scope,
                sender.as_str(),
                body,
                timestamp,
                self.bucket,
            ),
        }
    }

    /// Admit one message event. Check and record happen under one lock, so
    /// two concurrent deliveries of the same message cannot both be `New`.
    /// `peer` is the other participant of the thread the message belongs to.
    pub fn admit_message(
        &self,
        keys: &MessageKeys,
        peer: &UserId,
        sender: &UserId,
        body: &str,
    ) -> Admission {
        let mut retention = self.lock();
        let now = Instant::now();

        if keys.seen_in(&retention.seen) {
            for key in keys.record_set() {
                retention.record(key, now, self.capacity);
            }
            return Admission::Duplicate;
        }

        let echo = EchoKey::new(peer, sender, body);
        let pending = retention.echoes.iter().position(|(key, _)| *key == echo);
        for key in keys.record_set() {
            retention.record(key, now, self.capacity);
        }
        match pending {
            Some(pos) => {
                retention.echoes.remove(pos);
                Admission::Echo(echo)
            }
            None => Admission::New,
        }
    }

    /// Register that `sender` just sent `body` to `peer` optimistically. The
    /// next copy of it in that conversation, from any channel, is reported as
    /// `Admission::Echo`.
    pub fn expect_echo(&self, peer: &UserId, sender: &UserId, body: &str) -> EchoKey {
        let mut retention = self.lock();
        let key = EchoKey::new(peer, sender, body);
        retention.echoes.push_back((key.clone(), Instant::now()));
        while retention.echoes.len() > self.capacity {
            retention.echoes.pop_front();
        }
        key
    }

    pub fn reset(&self) {
        let mut retention = self.retention.lock().unwrap_or_else(PoisonError::into_inner);
        *retention = Retention::default();
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
