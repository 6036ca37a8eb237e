use crate::cache::RevisionToken;
use std::io;

/// Errors returned synchronously to callers of the [`Registry`](crate::Registry).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A required argument was missing or empty (event type, reducer).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A reducer was already registered for this event type and the
    /// registry is configured with [`DuplicatePolicy::Reject`](crate::DuplicatePolicy::Reject).
    #[error("a reducer is already registered for event type '{0}'")]
    DuplicateReducer(String),

    /// The store spawns background tasks and must be created inside a Tokio runtime.
    #[error("create_store must be called from within a Tokio runtime")]
    NoRuntime,

    #[error("event store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from an [`EventStore`](crate::EventStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document '{0}' not found")]
    NotFound(String),

    /// A document with this id already exists.
    #[error("document '{0}' already exists")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The store or its feed was shut down.
    #[error("event store closed")]
    Closed,
}

/// Errors from a [`StateCache`](crate::StateCache) or the
/// [`ConcurrencyGuard`](crate::ConcurrencyGuard) writing to it.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No row exists under this id.
    #[error("cache row '{0}' not found")]
    NotFound(String),

    /// The supplied revision token is not the row's current token.
    #[error("revision conflict on cache row '{row_id}': supplied {expected:?}, current {actual:?}")]
    Conflict {
        row_id: String,
        expected: Option<RevisionToken>,
        actual: Option<RevisionToken>,
    },

    /// Conflicts kept occurring past the configured retry bound.
    #[error("cache row '{row_id}' still conflicting after {attempts} attempts")]
    RetriesExhausted { row_id: String, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("state cache closed")]
    Closed,
}

impl CacheError {
    /// True for the conflict class: a missing row or a stale token. These
    /// are resolved by refetching the current token and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CacheError::NotFound(_) | CacheError::Conflict { .. })
    }
}
