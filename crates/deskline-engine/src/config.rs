//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration for local development and tests.

use std::time::Duration;

/// Tunables of the sync engine and its retry policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a single remote store call.
    /// Env: `DESKLINE_REMOTE_TIMEOUT_MS`
    /// Default: 5000
    pub remote_timeout: Duration,

    /// Delivery attempts per outbox entry before it is parked as failed.
    /// Env: `DESKLINE_MAX_SYNC_ATTEMPTS`
    /// Default: 5
    pub max_attempts: u32,

    /// First backoff delay after a transient failure; doubles per attempt.
    /// Env: `DESKLINE_RETRY_INITIAL_MS`
    /// Default: 500
    pub retry_initial: Duration,

    /// Upper bound of the backoff delay.
    /// Env: `DESKLINE_RETRY_MAX_MS`
    /// Default: 30000
    pub retry_max: Duration,

    /// How often the drain coordinator sweeps for chats with pending
    /// outbox entries (kicks from mutations arrive sooner).
    /// Env: `DESKLINE_DRAIN_INTERVAL_MS`
    /// Default: 2000
    pub drain_interval: Duration,

    /// Capacity of the engine event channel.
    /// Env: `DESKLINE_EVENT_CAPACITY`
    /// Default: 256
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_millis(5000),
            max_attempts: 5,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_millis(30_000),
            drain_interval: Duration::from_millis(2000),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_millis("DESKLINE_REMOTE_TIMEOUT_MS") {
            config.remote_timeout = ms;
        }

        if let Ok(val) = std::env::var("DESKLINE_MAX_SYNC_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_attempts = n,
                _ => tracing::warn!(value = %val, "Invalid DESKLINE_MAX_SYNC_ATTEMPTS, using default"),
            }
        }

        if let Some(ms) = env_millis("DESKLINE_RETRY_INITIAL_MS") {
            config.retry_initial = ms;
        }

        if let Some(ms) = env_millis("DESKLINE_RETRY_MAX_MS") {
            config.retry_max = ms;
        }

        if let Some(ms) = env_millis("DESKLINE_DRAIN_INTERVAL_MS") {
            config.drain_interval = ms;
        }

        if let Ok(val) = std::env::var("DESKLINE_EVENT_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid DESKLINE_EVENT_CAPACITY, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Fast-retry profile for tests: millisecond backoff, short sweeps.
    pub fn fast() -> Self {
        Self {
            remote_timeout: Duration::from_millis(500),
            max_attempts: 5,
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(40),
            drain_interval: Duration::from_millis(25),
            event_capacity: 256,
        }
    }
}

/// Read a millisecond duration from the environment; `None` when unset or
/// unparseable (with a warning for the latter).
fn env_millis(key: &str) -> Option<Duration> {
    let val = std::env::var(key).ok()?;
    match val.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, value = %val, "Invalid duration, using default");
            None
        }
    }
}
