//! Non-fatal conditions reported while projecting.
//!
//! Faults never interrupt dispatch. Each one is logged at its severity and
//! broadcast to anyone holding a receiver from [`Store::faults`](crate::Store::faults).

use log::{error, warn};
use tokio::sync::broadcast;

/// A reported condition. The projector keeps running after every variant
/// except a `FeedFailure` with `fatal` set, which stops the feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// A deletion was observed on the append-only event stream.
    #[error(
        "event {id} (seq {seq}) was deleted from the event store; events are append-only and must never be deleted, investigate immediately"
    )]
    IntegrityViolation { id: String, seq: u64 },

    /// A change without a sequence or a document reached the projector.
    #[error("invalid event action: change {id:?} (seq {seq}) has no sequence or document")]
    InvalidChange { id: String, seq: u64 },

    #[error("unrecognised action {action_type}")]
    UnrecognizedAction { action_type: String },

    #[error("unrecognised event {event_type} (id {id}, seq {seq})")]
    UnrecognizedEvent {
        event_type: String,
        id: String,
        seq: u64,
    },

    /// A cache write failed with a non-conflict error. In-memory state is unaffected.
    #[error("state cache write failed at seq {seq}: {message}")]
    CacheFailure { seq: u64, message: String },

    /// The change feed errored or ended. `fatal` means projection has stopped.
    #[error("event feed error: {message}")]
    FeedFailure { message: String, fatal: bool },
}

/// Cloneable handle that logs and broadcasts [`Fault`]s.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: broadcast::Sender<Fault>,
}

impl FaultReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        FaultReporter { tx }
    }

    pub fn report(&self, fault: Fault) {
        match &fault {
            Fault::FeedFailure { fatal: false, .. } => warn!("eventfold-registry: {fault}"),
            _ => error!("eventfold-registry: {fault}"),
        }
        // No receivers is fine; the log line is the record of last resort.
        let _ = self.tx.send(fault);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Fault> {
        self.tx.subscribe()
    }
}
