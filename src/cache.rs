//! The state cache interface and an in-memory implementation.
//!
//! A cache holds one logical row per row id: the projected state, the
//! sequence cursor it reflects, and a revision token. Writes are
//! optimistic: the writer supplies the token it last observed and the cache
//! rejects the write if the row has moved on.

use crate::error::CacheError;
use crate::state::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Opaque revision of a cache row, CouchDB style: `<generation>-<hash>`.
///
/// # Examples
///
/// ```
/// use eventfold_registry::RevisionToken;
///
/// let first = RevisionToken::next(None, b"{\"count\":1}");
/// assert_eq!(first.generation(), 1);
/// let second = RevisionToken::next(Some(&first), b"{\"count\":2}");
/// assert_eq!(second.generation(), 2);
/// assert_ne!(first, second);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub fn new(token: impl Into<String>) -> Self {
        RevisionToken(token.into())
    }

    /// Token for a row written after `previous` with the given serialized body.
    pub fn next(previous: Option<&RevisionToken>, body: &[u8]) -> Self {
        let generation = previous.map_or(0, RevisionToken::generation) + 1;
        let hash = xxhash_rust::xxh64::xxh64(body, 0);
        RevisionToken(format!("{generation}-{hash:016x}"))
    }

    /// Leading generation number, or 0 if the token has none.
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single cached row: state, sequence cursor, revision token.
///
/// On writes `rev` carries the token the writer last observed (`None` to
/// create the row). On reads it carries the row's current token.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheRow<S> {
    pub state: Arc<S>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<RevisionToken>,
}

impl<S> CacheRow<S> {
    pub fn new(state: Arc<S>, seq: u64, rev: Option<RevisionToken>) -> Self {
        CacheRow { state, seq, rev }
    }
}

impl<S> Clone for CacheRow<S> {
    fn clone(&self) -> Self {
        CacheRow {
            state: Arc::clone(&self.state),
            seq: self.seq,
            rev: self.rev.clone(),
        }
    }
}

/// Storage for the projected state between restarts.
#[async_trait]
pub trait StateCache<S: State>: Send + Sync {
    /// Fetch the latest version of a row. Fails with
    /// [`CacheError::NotFound`] if no row exists.
    async fn get(&self, row_id: &str) -> Result<CacheRow<S>, CacheError>;

    /// Write a row, guarded by `row.rev`. Returns the row's new token.
    ///
    /// Fails with [`CacheError::Conflict`] if a row exists and `row.rev` is
    /// not its current token, and with [`CacheError::NotFound`] if `row.rev`
    /// is set but no row exists.
    async fn put(&self, row_id: &str, row: CacheRow<S>) -> Result<RevisionToken, CacheError>;
}

#[async_trait]
impl<S: State, T: StateCache<S> + ?Sized> StateCache<S> for Arc<T> {
    async fn get(&self, row_id: &str) -> Result<CacheRow<S>, CacheError> {
        (**self).get(row_id).await
    }

    async fn put(&self, row_id: &str, row: CacheRow<S>) -> Result<RevisionToken, CacheError> {
        (**self).put(row_id, row).await
    }
}

/// Optimistic-concurrency check shared by the cache implementations.
pub(crate) fn check_revision(
    row_id: &str,
    current: Option<&RevisionToken>,
    supplied: Option<&RevisionToken>,
) -> Result<(), CacheError> {
    match (current, supplied) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(CacheError::NotFound(row_id.to_string())),
        (Some(current), Some(supplied)) if current == supplied => Ok(()),
        (current, supplied) => Err(CacheError::Conflict {
            row_id: row_id.to_string(),
            expected: supplied.cloned(),
            actual: current.cloned(),
        }),
    }
}

/// In-memory state cache. Cloning shares the rows.
pub struct MemoryStateCache<S> {
    rows: Arc<Mutex<HashMap<String, CacheRow<S>>>>,
}

impl<S> MemoryStateCache<S> {
    pub fn new() -> Self {
        MemoryStateCache {
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheRow<S>>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current token of a row, if the row exists.
    pub fn revision(&self, row_id: &str) -> Option<RevisionToken> {
        self.rows().get(row_id).and_then(|row| row.rev.clone())
    }
}

impl<S> Default for MemoryStateCache<S> {
    fn default() -> Self {
        MemoryStateCache::new()
    }
}

impl<S> Clone for MemoryStateCache<S> {
    fn clone(&self) -> Self {
        MemoryStateCache {
            rows: Arc::clone(&self.rows),
        }
    }
}

#[async_trait]
impl<S: State> StateCache<S> for MemoryStateCache<S> {
    async fn get(&self, row_id: &str) -> Result<CacheRow<S>, CacheError> {
        self.rows()
            .get(row_id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(row_id.to_string()))
    }

    async fn put(&self, row_id: &str, row: CacheRow<S>) -> Result<RevisionToken, CacheError> {
        let body = serde_json::to_vec(&row)?;
        let mut rows = self.rows();
        let current = rows.get(row_id).and_then(|r| r.rev.as_ref());
        check_revision(row_id, current, row.rev.as_ref())?;

        let token = RevisionToken::next(current, &body);
        rows.insert(
            row_id.to_string(),
            CacheRow::new(row.state, row.seq, Some(token.clone())),
        );
        Ok(token)
    }
}
