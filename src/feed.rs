use crate::config::FeedPolicy;
use crate::event::ChangeRecord;
use crate::fault::{Fault, FaultReporter};
use crate::source::{ChangesOptions, EventStore};
use futures::StreamExt;
use log::info;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Health of the change feed, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedHealth {
    /// Waiting for hydration to finish.
    Starting,
    /// Subscribed to changes after `since`. Published as soon as the feed is
    /// opened, before anything is delivered; a feed that then fails moves on
    /// to `Reconnecting` or `Failed`.
    Live { since: u64 },
    /// The feed failed and will be reopened from `since`.
    Reconnecting {
        attempt: u32,
        since: u64,
        error: String,
    },
    /// The feed failed for good. Projection has stopped; state is frozen at
    /// the last applied change.
    Failed { error: String },
    /// Shut down on request.
    Stopped,
}

impl FeedHealth {
    pub fn is_live(&self) -> bool {
        matches!(self, FeedHealth::Live { .. })
    }
}

/// Follows the event store's live change feed and hands each change to a
/// sink, one at a time, in store order.
///
/// Deletions are integrity violations: they are reported and skipped, and
/// the feed keeps going. When the feed fails the supervisor applies the
/// [`FeedPolicy`]. Reconnecting resumes strictly after the last sequence
/// seen, so no change is skipped or applied twice.
pub struct ChangeFeedListener {
    health: Arc<watch::Sender<FeedHealth>>,
    task: JoinHandle<()>,
}

impl ChangeFeedListener {
    /// Start listening from `since` (exclusive).
    ///
    /// The sink returns `false` once its consumer is gone, which ends the
    /// listener.
    pub fn spawn<F>(
        source: Arc<dyn EventStore>,
        since: u64,
        policy: FeedPolicy,
        faults: FaultReporter,
        runtime: &tokio::runtime::Handle,
        sink: F,
    ) -> Self
    where
        F: Fn(ChangeRecord) -> bool + Send + Sync + 'static,
    {
        let (health, _) = watch::channel(FeedHealth::Starting);
        let health = Arc::new(health);
        let task = runtime.spawn(supervise(
            source,
            since,
            policy,
            faults,
            Arc::clone(&health),
            sink,
        ));
        ChangeFeedListener { health, task }
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.health.subscribe()
    }

    pub fn current_health(&self) -> FeedHealth {
        self.health.borrow().clone()
    }

    /// Stop listening. Changes already handed to the sink stay applied.
    pub fn stop(&self) {
        self.task.abort();
        self.health.send_replace(FeedHealth::Stopped);
    }
}

impl Drop for ChangeFeedListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn supervise<F>(
    source: Arc<dyn EventStore>,
    mut since: u64,
    policy: FeedPolicy,
    faults: FaultReporter,
    health: Arc<watch::Sender<FeedHealth>>,
    sink: F,
) where
    F: Fn(ChangeRecord) -> bool + Send + Sync + 'static,
{
    let mut attempt = 0u32;
    loop {
        let mut feed = source.changes(ChangesOptions::live(since));
        health.send_replace(FeedHealth::Live { since });
        info!("eventfold-registry: listening for changes after seq {since}");

        let error = loop {
            match feed.next().await {
                Some(Ok(change)) => {
                    attempt = 0;
                    since = since.max(change.seq);
                    if change.deleted {
                        faults.report(Fault::IntegrityViolation {
                            id: change.id,
                            seq: change.seq,
                        });
                        continue;
                    }
                    if !sink(change) {
                        health.send_replace(FeedHealth::Stopped);
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "change feed ended".to_string(),
            }
        };

        attempt += 1;
        if !policy.allows(attempt) {
            faults.report(Fault::FeedFailure {
                message: error.clone(),
                fatal: true,
            });
            health.send_replace(FeedHealth::Failed { error });
            return;
        }

        faults.report(Fault::FeedFailure {
            message: error.clone(),
            fatal: false,
        });
        health.send_replace(FeedHealth::Reconnecting {
            attempt,
            since,
            error,
        });
        tokio::time::sleep(policy.delay(attempt)).await;
    }
}
