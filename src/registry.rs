use crate::cache::StateCache;
use crate::config::{FeedPolicy, RegistryConfig, RetryPolicy};
use crate::error::RegistryError;
use crate::event::{ChangeRecord, Event, NewEvent};
use crate::fault::FaultReporter;
use crate::feed::ChangeFeedListener;
use crate::guard::ConcurrencyGuard;
use crate::id;
use crate::projector::{Action, StateProjector};
use crate::reducers::{DuplicatePolicy, ReduceFn, ReducerRegistry};
use crate::source::EventStore;
use crate::state::State;
use crate::store::{Enhancer, Store};
use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// An event-sourced state registry.
///
/// Owns the reducer table and at most one [`Store`]. Events written with
/// [`emit`](Registry::emit) go to the event store; the store's change feed
/// brings them back and folds them into state through the registered
/// reducers. Projected state is cached with its sequence cursor so a restart
/// resumes where it left off.
///
/// # Examples
///
/// ```
/// use eventfold_registry::{MemoryEventStore, MemoryStateCache, NewEvent, Registry};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry: Registry<u64> = Registry::builder(MemoryEventStore::new())
///     .cache(MemoryStateCache::new())
///     .build();
///
/// registry.register("clicked", |n: &Arc<u64>, _| Arc::new(**n + 1))?;
///
/// let store = registry.create_store(None)?;
/// store.ready().await;
///
/// registry.emit(NewEvent::new("clicked")).await?;
/// # Ok(())
/// # }
/// ```
pub struct Registry<S: State> {
    source: Arc<dyn EventStore>,
    cache: Option<Arc<dyn StateCache<S>>>,
    config: RegistryConfig,
    reducers: Arc<RwLock<ReducerRegistry<S>>>,
    faults: FaultReporter,
    store: OnceLock<Store<S>>,
}

/// Builder for configuring a [`Registry`].
pub struct RegistryBuilder<S: State> {
    source: Arc<dyn EventStore>,
    cache: Option<Arc<dyn StateCache<S>>>,
    config: RegistryConfig,
}

impl<S: State> RegistryBuilder<S> {
    /// Cache projected state in `cache`.
    pub fn cache(mut self, cache: impl StateCache<S> + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable cache writes (enabled by default).
    pub fn caching(mut self, enabled: bool) -> Self {
        self.config.cache_enabled = enabled;
        self
    }

    pub fn cache_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.config.cache_row_id = row_id.into();
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    pub fn cache_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.cache_retry = retry;
        self
    }

    pub fn feed_policy(mut self, policy: FeedPolicy) -> Self {
        self.config.feed = policy;
        self
    }

    pub fn build(self) -> Registry<S> {
        Registry {
            source: self.source,
            cache: self.cache,
            reducers: Arc::new(RwLock::new(ReducerRegistry::new(
                self.config.duplicate_policy,
            ))),
            faults: FaultReporter::new(self.config.fault_capacity),
            config: self.config,
            store: OnceLock::new(),
        }
    }
}

impl<S: State> Registry<S> {
    /// Create a registry over `source` with the default configuration and no
    /// cache.
    pub fn new(source: impl EventStore + 'static) -> Self {
        Registry::builder(source).build()
    }

    pub fn builder(source: impl EventStore + 'static) -> RegistryBuilder<S> {
        RegistryBuilder {
            source: Arc::new(source),
            cache: None,
            config: RegistryConfig::default(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a reducer for an event type.
    ///
    /// May be called before or after the store is created; events of a type
    /// with no reducer are reported and skipped.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidArgument`] if `event_type` is empty;
    /// [`RegistryError::DuplicateReducer`] under [`DuplicatePolicy::Reject`].
    pub fn register<F>(&self, event_type: &str, reducer: F) -> Result<(), RegistryError>
    where
        F: Fn(&Arc<S>, &Event) -> Arc<S> + Send + Sync + 'static,
    {
        self.register_reducer(event_type, Some(Arc::new(reducer)))
    }

    /// Register an already-boxed reducer, e.g. one taken from a table.
    ///
    /// # Errors
    ///
    /// As [`register`](Registry::register), plus
    /// [`RegistryError::InvalidArgument`] if `reducer` is `None`.
    pub fn register_reducer(
        &self,
        event_type: &str,
        reducer: Option<ReduceFn<S>>,
    ) -> Result<(), RegistryError> {
        self.reducers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(event_type, reducer)
    }

    /// The reducer registered for an event type.
    pub fn lookup(&self, event_type: &str) -> Option<ReduceFn<S>> {
        self.reducers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(event_type)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        self.reducers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .event_types()
            .map(str::to_string)
            .collect()
    }

    /// Write an event to the event store under a freshly generated id.
    ///
    /// The event reaches the state through the change feed, not directly.
    /// Returns the document as stored.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidArgument`] if the event has no type;
    /// [`RegistryError::Store`] if the write fails.
    pub async fn emit(&self, event: NewEvent) -> Result<Event, RegistryError> {
        if event.event_type.is_empty() {
            return Err(RegistryError::InvalidArgument("event type is required"));
        }
        let event = Event::from_new(id::generate(), event);
        let seq = self.source.put(event.clone()).await?;
        debug!(
            "eventfold-registry: emitted {} '{}' at seq {seq}",
            event.id, event.event_type
        );
        Ok(event)
    }

    /// Create the store, or return it if it already exists.
    ///
    /// The store starts empty. A background task hydrates it from the cache
    /// (if one is configured and holds a row) and then starts the change
    /// feed from the cached sequence, or from 0. Await
    /// [`Store::ready`] to wait for that barrier.
    ///
    /// `enhancer` is only used when the store is first created.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NoRuntime`] when called outside a Tokio runtime.
    pub fn create_store(
        &self,
        enhancer: Option<Arc<dyn Enhancer<S>>>,
    ) -> Result<Store<S>, RegistryError> {
        if let Some(store) = self.store.get() {
            return Ok(store.clone());
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        let store = self
            .store
            .get_or_init(|| self.start_store(enhancer, &runtime));
        Ok(store.clone())
    }

    /// The store, if [`create_store`](Registry::create_store) has been called.
    pub fn get_store(&self) -> Option<Store<S>> {
        self.store.get().cloned()
    }

    fn start_store(
        &self,
        enhancer: Option<Arc<dyn Enhancer<S>>>,
        runtime: &tokio::runtime::Handle,
    ) -> Store<S> {
        let guard = Arc::new(ConcurrencyGuard::new(
            self.cache.clone(),
            self.config.cache_row_id.clone(),
            self.config.cache_enabled,
            self.config.cache_retry,
        ));
        let projector = StateProjector::new(Arc::clone(&self.reducers), self.faults.clone());
        let store = Store::new(
            projector,
            Arc::clone(&guard),
            enhancer,
            self.faults.clone(),
            runtime,
        );
        store.dispatch(Action::Init);

        let source = Arc::clone(&self.source);
        let policy = self.config.feed;
        let faults = self.faults.clone();
        let handle = runtime.clone();
        let hydrating = store.clone();
        runtime.spawn(async move {
            let row = match guard.hydrate().await {
                Ok(row) => row,
                Err(e) => {
                    warn!(
                        "eventfold-registry: cannot hydrate from cache ({e}), projecting from seq 0"
                    );
                    None
                }
            };
            let since = row.as_ref().map_or(0, |row| row.seq);
            debug!("eventfold-registry: hydrated at seq {since}");
            hydrating.complete_hydration(row);
            if hydrating.is_shut_down() {
                debug!("eventfold-registry: store shut down during hydration, feed not started");
                hydrating.mark_ready();
                return;
            }

            let weak = hydrating.downgrade();
            let sink = move |change: ChangeRecord| match weak.upgrade() {
                Some(store) => {
                    store.dispatch(Action::Event(change));
                    true
                }
                None => false,
            };
            let listener = ChangeFeedListener::spawn(source, since, policy, faults, &handle, sink);
            hydrating.attach_feed(listener);
        });

        store
    }
}

impl<S: State> fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Registry {{ {} }}", self.event_types().join(", "))
    }
}
