use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Engine tuning. Every field can be overridden through `STRAND_*` variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fast poll for messages since last check. Also the dedup timestamp bucket.
    pub message_poll_interval: Duration,
    /// Thread-list recency poll.
    pub thread_poll_interval: Duration,
    /// Slow reconciliation poll of the active thread's history.
    pub reconcile_interval: Duration,
    pub page_size: u32,
    pub dedup_capacity: usize,
    pub dedup_window: Duration,
    /// Proximity to an edge, in pixels, for scroll decisions.
    pub scroll_threshold: f64,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Keepalive ping period on the push connection.
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    pub update_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_poll_interval: Duration::from_millis(2500),
            thread_poll_interval: Duration::from_millis(5000),
            reconcile_interval: Duration::from_millis(15000),
            page_size: 5,
            dedup_capacity: 500,
            dedup_window: Duration::from_secs(300),
            scroll_threshold: 100.0,
            reconnect_initial: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(30000),
            heartbeat_interval: Duration::from_secs(15),
            queue_capacity: 256,
            update_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "STRAND_MESSAGE_POLL_MS")? {
            config.message_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "STRAND_THREAD_POLL_MS")? {
            config.thread_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "STRAND_RECONCILE_MS")? {
            config.reconcile_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse(&lookup, "STRAND_PAGE_SIZE")? {
            config.page_size = size;
        }
        if let Some(cap) = parse(&lookup, "STRAND_DEDUP_CAPACITY")? {
            config.dedup_capacity = cap;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "STRAND_DEDUP_WINDOW_SECS")? {
            config.dedup_window = Duration::from_secs(secs);
        }
        if let Some(px) = parse(&lookup, "STRAND_SCROLL_THRESHOLD")? {
            config.scroll_threshold = px;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "STRAND_RECONNECT_INITIAL_MS")? {
            config.reconnect_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "STRAND_RECONNECT_MAX_MS")? {
            config.reconnect_max = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "STRAND_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message_poll_interval.is_zero() {
            return Err(ConfigError::Zero("STRAND_MESSAGE_POLL_MS"));
        }
        if self.thread_poll_interval.is_zero() {
            return Err(ConfigError::Zero("STRAND_THREAD_POLL_MS"));
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::Zero("STRAND_RECONCILE_MS"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Zero("STRAND_PAGE_SIZE"));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Zero("STRAND_DEDUP_CAPACITY"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("STRAND_HEARTBEAT_SECS"));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
