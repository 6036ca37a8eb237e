use crate::cache::{CacheRow, RevisionToken};
use crate::event::ChangeRecord;
use crate::fault::{Fault, FaultReporter};
use crate::feed::{ChangeFeedListener, FeedHealth};
use crate::guard::{CacheWriter, ConcurrencyGuard};
use crate::projector::{Action, StateProjector};
use crate::state::State;
use log::debug;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};

/// A subscriber callback, called with the state after each dispatch.
pub type Listener<S> = Arc<dyn Fn(&Arc<S>) + Send + Sync>;

/// Observes every action the store applies, with the resulting state.
///
/// Used for devtools, tracing or metrics. Called outside the store's lock,
/// before subscribers are notified.
pub trait Enhancer<S>: Send + Sync {
    fn on_dispatch(&self, action: &Action<S>, state: &Arc<S>);
}

impl<S, F> Enhancer<S> for F
where
    F: Fn(&Action<S>, &Arc<S>) + Send + Sync,
{
    fn on_dispatch(&self, action: &Action<S>, state: &Arc<S>) {
        self(action, state)
    }
}

/// Holds the projected state and lets callers read it, dispatch actions
/// and subscribe to changes.
///
/// Dispatch is synchronous and serialized: one action is reduced at a time.
/// Cache writes triggered by a dispatch run on a background task and never
/// block it.
///
/// Until hydration from the cache completes, `Event` actions are queued
/// rather than reduced. They are applied in order right after the cached
/// state is restored, so no event ever reaches a reducer ahead of the
/// hydrated state.
///
/// Cloning is cheap and yields a handle to the same store.
pub struct Store<S: State> {
    inner: Arc<StoreInner<S>>,
}

impl<S: State> Clone for Store<S> {
    fn clone(&self) -> Self {
        Store {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StoreInner<S: State> {
    cell: Mutex<Cell<S>>,
    subscribers: Mutex<Vec<(u64, Listener<S>)>>,
    next_subscriber: AtomicU64,
    enhancer: Option<Arc<dyn Enhancer<S>>>,
    guard: Arc<ConcurrencyGuard<S>>,
    writer: CacheWriter<S>,
    faults: FaultReporter,
    ready: watch::Sender<bool>,
    feed: Mutex<Option<ChangeFeedListener>>,
    shut_down: AtomicBool,
}

struct Cell<S> {
    state: Arc<S>,
    projector: StateProjector<S>,
    hydrated: bool,
    pending: VecDeque<ChangeRecord>,
}

struct Applied<S> {
    action: Action<S>,
    state: Arc<S>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: State> StoreInner<S> {
    /// Reduce one action. Called with the cell locked, so cache writes are
    /// queued in the same order the states were produced.
    fn apply(&self, cell: &mut Cell<S>, action: Action<S>) -> Applied<S> {
        let reduction = cell.projector.reduce_root(&cell.state, &action);
        cell.state = reduction.state;
        if reduction.persist {
            self.writer
                .persist(Arc::clone(&cell.state), cell.projector.cursor());
        }
        Applied {
            action,
            state: Arc::clone(&cell.state),
        }
    }

    /// Run the enhancer and notify subscribers, in registration order.
    fn publish(&self, applied: Applied<S>) {
        if let Some(enhancer) = &self.enhancer {
            enhancer.on_dispatch(&applied.action, &applied.state);
        }
        let listeners: Vec<Listener<S>> = lock(&self.subscribers)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&applied.state);
        }
    }
}

impl<S: State> Store<S> {
    pub(crate) fn new(
        projector: StateProjector<S>,
        guard: Arc<ConcurrencyGuard<S>>,
        enhancer: Option<Arc<dyn Enhancer<S>>>,
        faults: FaultReporter,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let writer = CacheWriter::spawn(Arc::clone(&guard), faults.clone(), runtime);
        let (ready, _) = watch::channel(false);
        Store {
            inner: Arc::new(StoreInner {
                cell: Mutex::new(Cell {
                    state: Arc::new(S::default()),
                    projector,
                    hydrated: false,
                    pending: VecDeque::new(),
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                enhancer,
                guard,
                writer,
                faults,
                ready,
                feed: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The current state snapshot.
    pub fn get_state(&self) -> Arc<S> {
        Arc::clone(&lock(&self.inner.cell).state)
    }

    /// Sequence of the last change folded into the state.
    pub fn cursor(&self) -> u64 {
        lock(&self.inner.cell).projector.cursor()
    }

    /// Reduce an action, then notify subscribers.
    pub fn dispatch(&self, action: Action<S>) {
        let applied = {
            let mut cell = lock(&self.inner.cell);
            match action {
                Action::Event(change) if !cell.hydrated => {
                    debug!(
                        "eventfold-registry: holding change seq {} until hydration completes",
                        change.seq
                    );
                    cell.pending.push_back(change);
                    return;
                }
                action => self.inner.apply(&mut cell, action),
            }
        };
        self.inner.publish(applied);
    }

    /// Register a callback run after every applied action.
    pub fn subscribe<F>(&self, listener: F) -> Subscription<S>
    where
        F: Fn(&Arc<S>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(listener)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Whether hydration has completed and the change feed is attached.
    pub fn is_hydrated(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until hydration has completed and the change feed is attached.
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = ready.wait_for(|hydrated| *hydrated).await;
    }

    /// Receive every [`Fault`] reported from now on.
    pub fn faults(&self) -> broadcast::Receiver<Fault> {
        self.inner.faults.subscribe()
    }

    /// Health of the change feed, once it has been started.
    pub fn feed_health(&self) -> Option<watch::Receiver<FeedHealth>> {
        lock(&self.inner.feed).as_ref().map(ChangeFeedListener::health)
    }

    /// The revision token the next cache write will supply.
    pub async fn revision(&self) -> Option<RevisionToken> {
        self.inner.guard.revision().await
    }

    /// Turn cache writes on or off. Projection is unaffected.
    pub fn set_caching(&self, enabled: bool) {
        self.inner.guard.set_enabled(enabled);
    }

    /// Wait until every cache write queued so far has finished.
    pub async fn flush(&self) {
        self.inner.writer.flush().await;
    }

    /// Stop following the change feed. The state stays readable.
    ///
    /// Called before the feed has started, it keeps the feed from starting.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        if let Some(feed) = lock(&self.inner.feed).as_ref() {
            feed.stop();
        }
    }

    /// Pass the hydration barrier: restore `row` if there is one, then apply
    /// every change queued in the meantime. The store is not reported ready
    /// until its feed is attached.
    pub(crate) fn complete_hydration(&self, row: Option<CacheRow<S>>) {
        let applied = {
            let mut cell = lock(&self.inner.cell);
            let mut applied = Vec::new();
            if let Some(row) = row {
                let hydrate = Action::Hydrate {
                    state: Some(row.state),
                    seq: row.seq,
                };
                applied.push(self.inner.apply(&mut cell, hydrate));
            }
            cell.hydrated = true;
            while let Some(change) = cell.pending.pop_front() {
                applied.push(self.inner.apply(&mut cell, Action::Event(change)));
            }
            applied
        };
        for applied in applied {
            self.inner.publish(applied);
        }
    }

    /// Whether [`shutdown`](Store::shutdown) has been called.
    pub(crate) fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Hold the live feed and signal readiness. A feed attached after
    /// shutdown is stopped straight away.
    pub(crate) fn attach_feed(&self, feed: ChangeFeedListener) {
        {
            let mut slot = lock(&self.inner.feed);
            if self.is_shut_down() {
                feed.stop();
            }
            *slot = Some(feed);
        }
        self.mark_ready();
    }

    pub(crate) fn mark_ready(&self) {
        self.inner.ready.send_replace(true);
    }

    pub(crate) fn downgrade(&self) -> WeakStore<S> {
        WeakStore(Arc::downgrade(&self.inner))
    }
}

impl<S: State> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("cursor", &self.cursor())
            .field("hydrated", &self.is_hydrated())
            .field("subscribers", &lock(&self.inner.subscribers).len())
            .finish()
    }
}

/// A store handle that does not keep the store alive.
pub(crate) struct WeakStore<S: State>(Weak<StoreInner<S>>);

impl<S: State> WeakStore<S> {
    pub(crate) fn upgrade(&self) -> Option<Store<S>> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

/// Returned by [`Store::subscribe`]. Dropping it leaves the callback
/// registered; call [`unsubscribe`](Subscription::unsubscribe) to remove it.
pub struct Subscription<S: State> {
    id: u64,
    store: Weak<StoreInner<S>>,
}

impl<S: State> Subscription<S> {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            lock(&inner.subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}
