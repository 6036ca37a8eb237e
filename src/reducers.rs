use crate::error::RegistryError;
use crate::event::Event;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A pure function that folds an event into state.
///
/// Reducers receive the current snapshot and return the next one. Returning
/// the input `Arc` unchanged (`Arc::clone(state)`) signals "no change": the
/// store compares by pointer and skips the cache write. Reducers must be pure
/// (no I/O, no side effects) for that comparison and for replay to hold.
///
/// # Examples
///
/// ```
/// use eventfold_registry::{reducer, Event, ReduceFn};
/// use std::sync::Arc;
///
/// let counter: ReduceFn<u64> = reducer(|n: &Arc<u64>, _event: &Event| Arc::new(**n + 1));
/// let next = counter(&Arc::new(1), &Event::new("id", "FOO"));
/// assert_eq!(*next, 2);
/// ```
pub type ReduceFn<S> = Arc<dyn Fn(&Arc<S>, &Event) -> Arc<S> + Send + Sync>;

/// Wrap a closure as a [`ReduceFn`].
pub fn reducer<S, F>(f: F) -> ReduceFn<S>
where
    F: Fn(&Arc<S>, &Event) -> Arc<S> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What to do when a reducer is registered for an event type that already
/// has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Replace the earlier reducer.
    #[default]
    Override,
    /// Keep the earlier reducer and fail with
    /// [`RegistryError::DuplicateReducer`].
    Reject,
}

/// Table of event type → reducer.
pub struct ReducerRegistry<S> {
    reducers: BTreeMap<String, ReduceFn<S>>,
    policy: DuplicatePolicy,
}

impl<S> ReducerRegistry<S> {
    pub fn new(policy: DuplicatePolicy) -> Self {
        ReducerRegistry {
            reducers: BTreeMap::new(),
            policy,
        }
    }

    /// Register a reducer for an event type.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidArgument`] if `event_type` is empty or
    /// `reducer` is `None`; [`RegistryError::DuplicateReducer`] if the type is
    /// taken and the policy is [`DuplicatePolicy::Reject`].
    pub fn register(
        &mut self,
        event_type: &str,
        reducer: Option<ReduceFn<S>>,
    ) -> Result<(), RegistryError> {
        if event_type.is_empty() {
            return Err(RegistryError::InvalidArgument("event type is required"));
        }
        let Some(reducer) = reducer else {
            return Err(RegistryError::InvalidArgument("reducer is required"));
        };

        if self.reducers.contains_key(event_type) {
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(RegistryError::DuplicateReducer(event_type.to_string()));
                }
                DuplicatePolicy::Override => {
                    debug!("eventfold-registry: replacing reducer for '{event_type}'");
                }
            }
        }
        self.reducers.insert(event_type.to_string(), reducer);
        Ok(())
    }

    pub fn lookup(&self, event_type: &str) -> Option<ReduceFn<S>> {
        self.reducers.get(event_type).cloned()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.reducers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }
}

impl<S> Default for ReducerRegistry<S> {
    fn default() -> Self {
        ReducerRegistry::new(DuplicatePolicy::default())
    }
}

impl<S> fmt::Debug for ReducerRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.event_types()).finish()
    }
}
