//! The event store interface consumed by the registry, and an in-process
//! implementation of it.

use crate::error::StoreError;
use crate::event::{ChangeRecord, Event};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// A stream of changes. Live feeds never end on their own; an `Err` item is
/// terminal and the feed cannot be resumed, only reopened.
pub type ChangeFeed = BoxStream<'static, Result<ChangeRecord, StoreError>>;

/// Options for [`EventStore::changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangesOptions {
    /// Deliver changes with a sequence strictly greater than this.
    pub since: u64,
    /// Keep the feed open and deliver new changes as they are written.
    pub live: bool,
    /// Attach the changed document to each record.
    pub include_docs: bool,
}

impl ChangesOptions {
    /// A live feed with documents, as the projection consumes it.
    pub fn live(since: u64) -> Self {
        ChangesOptions {
            since,
            live: true,
            include_docs: true,
        }
    }

    /// A one-shot feed that ends once it has caught up.
    pub fn once(since: u64) -> Self {
        ChangesOptions {
            since,
            live: false,
            include_docs: true,
        }
    }
}

impl Default for ChangesOptions {
    fn default() -> Self {
        ChangesOptions::once(0)
    }
}

/// An append-only store of events with an ordered change feed.
///
/// Storage, replication and indexing belong to the implementation. The
/// registry needs three things: append a document, fetch one by id, and
/// follow changes from a sequence cursor.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event. Returns the sequence assigned to the change.
    async fn put(&self, event: Event) -> Result<u64, StoreError>;

    /// Fetch a document by id.
    async fn get(&self, id: &str) -> Result<Event, StoreError>;

    /// Open a change feed.
    fn changes(&self, options: ChangesOptions) -> ChangeFeed;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn put(&self, event: Event) -> Result<u64, StoreError> {
        (**self).put(event).await
    }

    async fn get(&self, id: &str) -> Result<Event, StoreError> {
        (**self).get(id).await
    }

    fn changes(&self, options: ChangesOptions) -> ChangeFeed {
        (**self).changes(options)
    }
}

/// In-process event store.
///
/// Sequences start at 1. Putting an id that already exists fails with
/// [`StoreError::Conflict`]. Cloning shares the underlying log.
#[derive(Clone)]
pub struct MemoryEventStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    log: Mutex<MemoryLog>,
    head: watch::Sender<u64>,
}

#[derive(Default)]
struct MemoryLog {
    changes: Vec<ChangeRecord>,
    docs: HashMap<String, Event>,
}

impl MemoryInner {
    fn log(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changes_since(&self, since: u64, include_docs: bool) -> Vec<ChangeRecord> {
        let log = self.log();
        let start = (since as usize).min(log.changes.len());
        log.changes[start..]
            .iter()
            .cloned()
            .map(|c| if include_docs { c } else { c.without_doc() })
            .collect()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        MemoryEventStore {
            inner: Arc::new(MemoryInner {
                log: Mutex::new(MemoryLog::default()),
                head,
            }),
        }
    }

    /// Delete a document, appending a tombstone to the change feed.
    ///
    /// Event stores are append-only and the registry treats a deletion as an
    /// integrity violation. This exists so that condition can be produced
    /// deliberately.
    pub fn delete(&self, id: &str) -> Result<u64, StoreError> {
        let seq = {
            let mut log = self.inner.log();
            if log.docs.remove(id).is_none() {
                return Err(StoreError::NotFound(id.to_string()));
            }
            let seq = log.changes.len() as u64 + 1;
            log.changes.push(ChangeRecord::deletion(seq, id));
            seq
        };
        self.inner.head.send_replace(seq);
        Ok(seq)
    }

    /// Number of changes written, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.log().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        MemoryEventStore::new()
    }
}

impl std::fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventStore")
            .field("changes", &self.len())
            .finish()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn put(&self, event: Event) -> Result<u64, StoreError> {
        let seq = {
            let mut log = self.inner.log();
            if log.docs.contains_key(&event.id) {
                return Err(StoreError::Conflict(event.id));
            }
            let seq = log.changes.len() as u64 + 1;
            log.docs.insert(event.id.clone(), event.clone());
            log.changes.push(ChangeRecord::event(seq, event));
            seq
        };
        self.inner.head.send_replace(seq);
        Ok(seq)
    }

    async fn get(&self, id: &str) -> Result<Event, StoreError> {
        self.inner
            .log()
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn changes(&self, options: ChangesOptions) -> ChangeFeed {
        struct Cursor {
            inner: Arc<MemoryInner>,
            head: watch::Receiver<u64>,
            since: u64,
            options: ChangesOptions,
            pending: VecDeque<ChangeRecord>,
        }

        // Subscribe before the first read so no write can fall between them.
        let cursor = Cursor {
            head: self.inner.head.subscribe(),
            inner: Arc::clone(&self.inner),
            since: options.since,
            options,
            pending: VecDeque::new(),
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(change) = cursor.pending.pop_front() {
                    cursor.since = change.seq;
                    return Some((Ok(change), cursor));
                }
                let fresh = cursor
                    .inner
                    .changes_since(cursor.since, cursor.options.include_docs);
                if !fresh.is_empty() {
                    cursor.pending.extend(fresh);
                    continue;
                }
                if !cursor.options.live || cursor.head.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}
