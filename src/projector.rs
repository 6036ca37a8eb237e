use crate::event::ChangeRecord;
use crate::fault::{Fault, FaultReporter};
use crate::reducers::ReducerRegistry;
use log::debug;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// An action dispatched into a [`Store`](crate::Store).
pub enum Action<S> {
    /// Dispatched once when the store is created. Leaves state unchanged.
    Init,
    /// A change from the event feed, to be folded through its reducer.
    Event(ChangeRecord),
    /// Replace state with a cached snapshot taken at `seq`. With `state`
    /// absent the current state is kept.
    Hydrate { state: Option<Arc<S>>, seq: u64 },
    /// Any action this projector does not know. Reported and ignored.
    Other(String),
}

impl<S> Action<S> {
    /// The wire name of the action.
    pub fn action_type(&self) -> &str {
        match self {
            Action::Init => "@@INIT",
            Action::Event(_) => "EVENT",
            Action::Hydrate { .. } => "HYDRATE_STATE",
            Action::Other(action_type) => action_type,
        }
    }
}

impl<S> fmt::Debug for Action<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Event(change) => f.debug_tuple("Event").field(change).finish(),
            Action::Hydrate { state, seq } => f
                .debug_struct("Hydrate")
                .field("state", &state.is_some())
                .field("seq", seq)
                .finish(),
            other => f.write_str(other.action_type()),
        }
    }
}

/// Result of reducing one action.
pub struct Reduction<S> {
    pub state: Arc<S>,
    /// True when an event produced a new state that should be cached.
    pub persist: bool,
}

impl<S> Reduction<S> {
    fn unchanged(state: &Arc<S>) -> Self {
        Reduction {
            state: Arc::clone(state),
            persist: false,
        }
    }
}

/// Root reducer: routes actions, folds events through the registered
/// reducers, and tracks the sequence cursor.
///
/// Never panics on bad input. Malformed changes, unknown actions and events
/// with no reducer are reported as [`Fault`]s and leave state unchanged, so
/// the store stays alive.
pub struct StateProjector<S> {
    reducers: Arc<RwLock<ReducerRegistry<S>>>,
    cursor: u64,
    faults: FaultReporter,
}

impl<S> StateProjector<S> {
    pub fn new(reducers: Arc<RwLock<ReducerRegistry<S>>>, faults: FaultReporter) -> Self {
        StateProjector {
            reducers,
            cursor: 0,
            faults,
        }
    }

    /// Sequence of the last change applied (or hydrated).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn reduce_root(&mut self, state: &Arc<S>, action: &Action<S>) -> Reduction<S> {
        match action {
            Action::Init => Reduction::unchanged(state),
            Action::Event(change) => {
                let next = self.reduce_event(state, change);
                if Arc::ptr_eq(&next, state) {
                    return Reduction::unchanged(state);
                }
                Reduction {
                    state: next,
                    persist: true,
                }
            }
            Action::Hydrate {
                state: Some(snapshot),
                seq,
            } => {
                self.cursor = *seq;
                Reduction {
                    state: Arc::clone(snapshot),
                    persist: false,
                }
            }
            Action::Hydrate { state: None, .. } => Reduction::unchanged(state),
            Action::Other(action_type) => {
                self.faults.report(Fault::UnrecognizedAction {
                    action_type: action_type.clone(),
                });
                Reduction::unchanged(state)
            }
        }
    }

    /// Fold one change through the reducer registered for its document type.
    ///
    /// Changes at or below the cursor are already reflected in the state and
    /// are skipped, so the cursor never moves backwards. Returns the input
    /// `Arc` when nothing changed.
    pub fn reduce_event(&mut self, state: &Arc<S>, change: &ChangeRecord) -> Arc<S> {
        let doc = match &change.doc {
            Some(doc) if change.seq > 0 => doc,
            _ => {
                self.faults.report(Fault::InvalidChange {
                    id: change.id.clone(),
                    seq: change.seq,
                });
                return Arc::clone(state);
            }
        };

        if change.seq <= self.cursor {
            debug!(
                "eventfold-registry: skipping change {} at seq {}, already at seq {}",
                change.id, change.seq, self.cursor
            );
            return Arc::clone(state);
        }
        self.cursor = change.seq;

        // Clone the reducer out so the lock is released before it runs.
        let reducer = self
            .reducers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(&doc.event_type);

        match reducer {
            Some(reducer) => reducer(state, doc),
            None => {
                self.faults.report(Fault::UnrecognizedEvent {
                    event_type: doc.event_type.clone(),
                    id: doc.id.clone(),
                    seq: change.seq,
                });
                Arc::clone(state)
            }
        }
    }
}
