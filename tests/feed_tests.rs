mod common;

use common::{change, eventually, within, ScriptedSource};
use eventfold_registry::{
    ChangeFeedListener, ChangeRecord, EventStore, Fault, FaultReporter, FeedHealth, FeedPolicy,
    MemoryEventStore, StoreError,
};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;

struct Collected(Arc<Mutex<Vec<u64>>>);

impl Collected {
    fn new() -> Self {
        Collected(Arc::new(Mutex::new(Vec::new())))
    }

    fn sink(&self) -> impl Fn(ChangeRecord) -> bool + Send + Sync + 'static {
        let seen = Arc::clone(&self.0);
        move |change| {
            seen.lock().unwrap().push(change.seq);
            true
        }
    }

    fn seqs(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}

fn reconnect(max_attempts: Option<u32>) -> FeedPolicy {
    FeedPolicy::Reconnect {
        max_attempts,
        backoff_ms: 0,
    }
}

#[tokio::test]
async fn test_delivers_changes_in_order() {
    let source = Arc::new(ScriptedSource::new(vec![vec![
        Ok(change(1, "FOO")),
        Ok(change(2, "FOO")),
        Ok(change(3, "BAR")),
    ]]));
    let collected = Collected::new();
    let listener = ChangeFeedListener::spawn(
        source.clone(),
        0,
        FeedPolicy::Halt,
        FaultReporter::new(8),
        &Handle::current(),
        collected.sink(),
    );

    eventually(|| collected.seqs().len() == 3).await;
    assert_eq!(collected.seqs(), vec![1, 2, 3]);
    assert_eq!(listener.current_health(), FeedHealth::Live { since: 0 });
    assert_eq!(source.opened(), vec![0]);
}

#[tokio::test]
async fn test_halt_policy_fails_on_error() {
    let source = Arc::new(ScriptedSource::new(vec![vec![
        Ok(change(1, "FOO")),
        Err(StoreError::Closed),
    ]]));
    let faults = FaultReporter::new(8);
    let mut rx = faults.subscribe();
    let collected = Collected::new();
    let listener = ChangeFeedListener::spawn(
        source.clone(),
        0,
        FeedPolicy::Halt,
        faults,
        &Handle::current(),
        collected.sink(),
    );

    let mut health = listener.health();
    within(health.wait_for(|h| matches!(h, FeedHealth::Failed { .. })))
        .await
        .unwrap();
    assert_eq!(collected.seqs(), vec![1]);
    assert_eq!(
        within(rx.recv()).await.unwrap(),
        Fault::FeedFailure {
            message: "event store closed".into(),
            fatal: true,
        }
    );
    assert_eq!(source.opened(), vec![0]);
}

#[tokio::test]
async fn test_reconnect_resumes_after_last_seen() {
    let source = Arc::new(ScriptedSource::new(vec![
        vec![
            Ok(change(1, "FOO")),
            Ok(change(2, "FOO")),
            Err(StoreError::Closed),
        ],
        vec![Ok(change(3, "FOO"))],
    ]));
    let faults = FaultReporter::new(8);
    let mut rx = faults.subscribe();
    let collected = Collected::new();
    let listener = ChangeFeedListener::spawn(
        source.clone(),
        0,
        reconnect(Some(3)),
        faults,
        &Handle::current(),
        collected.sink(),
    );

    eventually(|| collected.seqs().len() == 3).await;
    assert_eq!(collected.seqs(), vec![1, 2, 3]);
    assert_eq!(source.opened(), vec![0, 2]);
    assert_eq!(listener.current_health(), FeedHealth::Live { since: 2 });
    assert!(matches!(
        within(rx.recv()).await.unwrap(),
        Fault::FeedFailure { fatal: false, .. }
    ));
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let source = Arc::new(ScriptedSource::new(vec![
        vec![Err(StoreError::Closed)],
        vec![Err(StoreError::Closed)],
    ]));
    let faults = FaultReporter::new(8);
    let mut rx = faults.subscribe();
    let listener = ChangeFeedListener::spawn(
        source.clone(),
        4,
        reconnect(Some(1)),
        faults,
        &Handle::current(),
        |_| true,
    );

    let mut health = listener.health();
    within(health.wait_for(|h| matches!(h, FeedHealth::Failed { .. })))
        .await
        .unwrap();
    assert_eq!(source.opened(), vec![4, 4]);
    assert!(matches!(
        within(rx.recv()).await.unwrap(),
        Fault::FeedFailure { fatal: false, .. }
    ));
    assert!(matches!(
        within(rx.recv()).await.unwrap(),
        Fault::FeedFailure { fatal: true, .. }
    ));
}

#[tokio::test]
async fn test_deletion_is_reported_and_skipped() {
    let source = Arc::new(ScriptedSource::new(vec![vec![
        Ok(change(1, "FOO")),
        Ok(ChangeRecord::deletion(2, "evt-1")),
        Ok(change(3, "FOO")),
    ]]));
    let faults = FaultReporter::new(8);
    let mut rx = faults.subscribe();
    let collected = Collected::new();
    let _listener = ChangeFeedListener::spawn(
        source,
        0,
        FeedPolicy::Halt,
        faults,
        &Handle::current(),
        collected.sink(),
    );

    eventually(|| collected.seqs().len() == 2).await;
    assert_eq!(collected.seqs(), vec![1, 3]);
    assert_eq!(
        within(rx.recv()).await.unwrap(),
        Fault::IntegrityViolation {
            id: "evt-1".into(),
            seq: 2,
        }
    );
}

#[tokio::test]
async fn test_sink_refusal_stops_listener() {
    let source = Arc::new(ScriptedSource::new(vec![vec![
        Ok(change(1, "FOO")),
        Ok(change(2, "FOO")),
    ]]));
    let listener = ChangeFeedListener::spawn(
        source,
        0,
        FeedPolicy::Halt,
        FaultReporter::new(8),
        &Handle::current(),
        |_| false,
    );

    let mut health = listener.health();
    within(health.wait_for(|h| *h == FeedHealth::Stopped))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_ends_live_feed() {
    let source = MemoryEventStore::new();
    let collected = Collected::new();
    let listener = ChangeFeedListener::spawn(
        Arc::new(source.clone()),
        0,
        FeedPolicy::Halt,
        FaultReporter::new(8),
        &Handle::current(),
        collected.sink(),
    );

    source.put(common::dummy_event("a", "FOO")).await.unwrap();
    eventually(|| collected.seqs() == vec![1]).await;

    listener.stop();
    assert_eq!(listener.current_health(), FeedHealth::Stopped);
    source.put(common::dummy_event("b", "FOO")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(collected.seqs(), vec![1]);
}

#[tokio::test]
async fn test_live_is_published_once_subscribed() {
    let source = Arc::new(ScriptedSource::new(vec![vec![]]));
    let collected = Collected::new();
    let listener = ChangeFeedListener::spawn(
        source.clone(),
        7,
        FeedPolicy::Halt,
        FaultReporter::new(8),
        &Handle::current(),
        collected.sink(),
    );

    let mut health = listener.health();
    within(health.wait_for(|h| *h == FeedHealth::Live { since: 7 }))
        .await
        .unwrap();
    assert!(collected.seqs().is_empty());
    assert_eq!(source.opened(), vec![7]);
}
