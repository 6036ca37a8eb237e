//! Event-sourced state registry.
//!
//! Events are appended to an [`EventStore`]. A [`Store`] follows the event
//! store's change feed and folds each event through the reducer registered
//! for its type, producing the application state. The state is cached
//! together with the last sequence applied and a revision token, so a
//! restarted process hydrates from the cache and resumes the feed from there
//! instead of replaying history.

pub mod cache;
mod config;
mod error;
mod event;
mod fault;
mod feed;
mod guard;
pub mod id;
mod log;
mod projector;
mod reducers;
mod registry;
pub mod snapshot;
mod source;
mod state;
mod store;

pub use self::log::EventLog;
pub use cache::{CacheRow, MemoryStateCache, RevisionToken, StateCache};
pub use config::{FeedPolicy, RegistryConfig, RetryPolicy};
pub use error::{CacheError, RegistryError, StoreError};
pub use event::{ChangeRecord, Event, NewEvent};
pub use fault::{Fault, FaultReporter};
pub use feed::{ChangeFeedListener, FeedHealth};
pub use guard::ConcurrencyGuard;
pub use projector::{Action, Reduction, StateProjector};
pub use reducers::{DuplicatePolicy, ReduceFn, ReducerRegistry, reducer};
pub use registry::{Registry, RegistryBuilder};
pub use snapshot::SnapshotCache;
pub use source::{ChangeFeed, ChangesOptions, EventStore, MemoryEventStore};
pub use state::State;
pub use store::{Enhancer, Listener, Store, Subscription};
