#![allow(dead_code)]

use async_trait::async_trait;
use eventfold_registry::{
    CacheError, CacheRow, ChangeFeed, ChangeRecord, ChangesOptions, Event, EventStore,
    MemoryStateCache, RevisionToken, StateCache, StoreError,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn dummy_event(id: &str, event_type: &str) -> Event {
    Event::new(id, event_type).with_payload(json!({"key": "value"}))
}

pub fn change(seq: u64, event_type: &str) -> ChangeRecord {
    ChangeRecord::event(seq, dummy_event(&format!("evt-{seq}"), event_type))
}

pub fn increment(state: &Arc<u64>, _event: &Event) -> Arc<u64> {
    Arc::new(**state + 1)
}

pub fn unchanged(state: &Arc<u64>, _event: &Event) -> Arc<u64> {
    Arc::clone(state)
}

#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsersState {
    pub users: BTreeMap<String, User>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
}

pub fn add_user(state: &Arc<UsersState>, event: &Event) -> Arc<UsersState> {
    let Some(payload) = &event.payload else {
        return Arc::clone(state);
    };
    let id = payload["id"].as_str().unwrap_or_default().to_string();
    let mut next = (**state).clone();
    next.users.insert(
        id,
        User {
            username: payload["username"].as_str().unwrap_or_default().to_string(),
            email: payload["email"].as_str().unwrap_or_default().to_string(),
        },
    );
    Arc::new(next)
}

pub fn update_email(state: &Arc<UsersState>, event: &Event) -> Arc<UsersState> {
    let Some(payload) = &event.payload else {
        return Arc::clone(state);
    };
    let id = payload["id"].as_str().unwrap_or_default();
    let Some(user) = state.users.get(id) else {
        return Arc::clone(state);
    };
    let mut user = user.clone();
    user.email = payload["email"].as_str().unwrap_or_default().to_string();
    let mut next = (**state).clone();
    next.users.insert(id.to_string(), user);
    Arc::new(next)
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("future did not complete in time")
}

/// A state cache over [`MemoryStateCache`] that records calls and can be
/// scripted to fail the next puts, or to hold `get` until released.
pub struct ScriptedCache<S> {
    inner: MemoryStateCache<S>,
    calls: Mutex<Vec<&'static str>>,
    put_failures: Mutex<VecDeque<CacheError>>,
    gate: Option<Arc<Notify>>,
}

impl<S> ScriptedCache<S> {
    pub fn new() -> Self {
        ScriptedCache {
            inner: MemoryStateCache::new(),
            calls: Mutex::new(Vec::new()),
            put_failures: Mutex::new(VecDeque::new()),
            gate: None,
        }
    }

    pub fn over(inner: MemoryStateCache<S>) -> Self {
        ScriptedCache {
            inner,
            ..ScriptedCache::new()
        }
    }

    /// Hold every `get` until the returned notifier is triggered.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn fail_next_put(&self, error: CacheError) {
        self.put_failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn puts(&self) -> usize {
        self.calls().iter().filter(|c| **c == "put").count()
    }

    pub fn revision(&self, row_id: &str) -> Option<RevisionToken> {
        self.inner.revision(row_id)
    }
}

#[async_trait]
impl<S: eventfold_registry::State> StateCache<S> for ScriptedCache<S> {
    async fn get(&self, row_id: &str) -> Result<CacheRow<S>, CacheError> {
        self.calls.lock().unwrap().push("get");
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.inner.get(row_id).await
    }

    async fn put(&self, row_id: &str, row: CacheRow<S>) -> Result<RevisionToken, CacheError> {
        self.calls.lock().unwrap().push("put");
        let failure = self.put_failures.lock().unwrap().pop_front();
        match failure {
            Some(error) => Err(error),
            None => self.inner.put(row_id, row).await,
        }
    }
}

pub fn conflict(row_id: &str) -> CacheError {
    CacheError::Conflict {
        row_id: row_id.to_string(),
        expected: None,
        actual: None,
    }
}

/// An event source whose feeds replay scripted items, one script per
/// `changes` call, then stay open without delivering anything more.
/// The items one feed delivers.
pub type Script = Vec<Result<ChangeRecord, StoreError>>;

#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    opened: Mutex<Vec<u64>>,
    next_seq: AtomicU64,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Self {
        ScriptedSource {
            scripts: Mutex::new(scripts.into()),
            ..ScriptedSource::default()
        }
    }

    /// The `since` of every feed opened so far.
    pub fn opened(&self) -> Vec<u64> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for ScriptedSource {
    async fn put(&self, _event: Event) -> Result<u64, StoreError> {
        Ok(self.next_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn get(&self, id: &str) -> Result<Event, StoreError> {
        Err(StoreError::NotFound(id.to_string()))
    }

    fn changes(&self, options: ChangesOptions) -> ChangeFeed {
        self.opened.lock().unwrap().push(options.since);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        stream::iter(script).chain(stream::pending()).boxed()
    }
}
