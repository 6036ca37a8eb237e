//! Registry configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! {
//!   "cache_row_id": "users_state",
//!   "duplicate_policy": "reject",
//!   "cache_retry": { "max_attempts": 3, "backoff_ms": 5 },
//!   "feed": { "mode": "halt" }
//! }
//! ```

use crate::reducers::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Bound on the cache writer's conflict retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Conflicts tolerated for one write. `None` retries for as long as
    /// conflicts keep occurring.
    pub max_attempts: Option<u32>,
    /// Linear backoff step between retries.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Retry every conflict immediately, without limit.
    pub fn unbounded() -> Self {
        RetryPolicy {
            max_attempts: None,
            backoff_ms: 0,
        }
    }

    pub(crate) fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: Some(8),
            backoff_ms: 10,
        }
    }
}

/// What the feed supervisor does when the change feed fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FeedPolicy {
    /// Stop projecting and report the feed as failed.
    Halt,
    /// Reopen the feed from the last sequence seen, with linear backoff.
    Reconnect {
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default)]
        backoff_ms: u64,
    },
}

impl FeedPolicy {
    pub(crate) fn allows(&self, attempt: u32) -> bool {
        match self {
            FeedPolicy::Halt => false,
            FeedPolicy::Reconnect { max_attempts, .. } => {
                max_attempts.is_none_or(|max| attempt <= max)
            }
        }
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        match self {
            FeedPolicy::Halt => Duration::ZERO,
            FeedPolicy::Reconnect { backoff_ms, .. } => {
                Duration::from_millis(backoff_ms.saturating_mul(u64::from(attempt)))
            }
        }
    }
}

impl Default for FeedPolicy {
    fn default() -> Self {
        FeedPolicy::Reconnect {
            max_attempts: Some(5),
            backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Write projected state to the cache. Without a cache this has no effect.
    pub cache_enabled: bool,
    /// Id of the single cache row holding the state.
    pub cache_row_id: String,
    pub duplicate_policy: DuplicatePolicy,
    pub cache_retry: RetryPolicy,
    pub feed: FeedPolicy,
    /// Buffer size of the fault broadcast channel.
    pub fault_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            cache_enabled: true,
            cache_row_id: "state".to_string(),
            duplicate_policy: DuplicatePolicy::default(),
            cache_retry: RetryPolicy::default(),
            feed: FeedPolicy::default(),
            fault_capacity: 256,
        }
    }
}

impl RegistryConfig {
    /// Load a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
