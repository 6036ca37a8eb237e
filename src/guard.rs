use crate::cache::{CacheRow, RevisionToken, StateCache};
use crate::config::RetryPolicy;
use crate::error::CacheError;
use crate::fault::{Fault, FaultReporter};
use crate::state::State;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};

/// Writes projected state to the cache row under optimistic concurrency.
///
/// Holds the revision token last observed from the cache. Every write
/// supplies it; on a conflict (stale token or missing row) the guard
/// refetches the row's current token and retries, up to the configured
/// [`RetryPolicy`]. The token lock also serializes writes from this process.
pub struct ConcurrencyGuard<S: State> {
    cache: Option<Arc<dyn StateCache<S>>>,
    row_id: String,
    enabled: AtomicBool,
    retry: RetryPolicy,
    token: Mutex<Option<RevisionToken>>,
}

impl<S: State> ConcurrencyGuard<S> {
    pub fn new(
        cache: Option<Arc<dyn StateCache<S>>>,
        row_id: impl Into<String>,
        enabled: bool,
        retry: RetryPolicy,
    ) -> Self {
        ConcurrencyGuard {
            cache,
            row_id: row_id.into(),
            enabled: AtomicBool::new(enabled),
            retry,
            token: Mutex::new(None),
        }
    }

    /// True when writes will reach a cache.
    pub fn is_caching(&self) -> bool {
        self.cache.is_some() && self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn row_id(&self) -> &str {
        &self.row_id
    }

    /// The token the next write will supply.
    pub async fn revision(&self) -> Option<RevisionToken> {
        self.token.lock().await.clone()
    }

    /// Read the cached row and adopt its token.
    ///
    /// Returns `Ok(None)` when no cache is configured or no row exists yet.
    pub async fn hydrate(&self) -> Result<Option<CacheRow<S>>, CacheError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let mut token = self.token.lock().await;
        match cache.get(&self.row_id).await {
            Ok(row) => {
                token.clone_from(&row.rev);
                Ok(Some(row))
            }
            Err(CacheError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write `state` at cursor `seq` to the cache row.
    ///
    /// A no-op returning `Ok(None)` when caching is disabled or no cache is
    /// configured. On success the returned token is kept for the next write.
    ///
    /// # Errors
    ///
    /// [`CacheError::RetriesExhausted`] if conflicts outlast the retry
    /// policy; any non-conflict cache error as-is.
    pub async fn cache_state(
        &self,
        state: Arc<S>,
        seq: u64,
    ) -> Result<Option<RevisionToken>, CacheError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let mut token = self.token.lock().await;
        let mut conflicts = 0;
        loop {
            let row = CacheRow::new(Arc::clone(&state), seq, token.clone());
            let error = match cache.put(&self.row_id, row).await {
                Ok(next) => {
                    *token = Some(next.clone());
                    return Ok(Some(next));
                }
                Err(e) if e.is_conflict() => e,
                Err(e) => return Err(e),
            };

            conflicts += 1;
            if !self.retry.allows(conflicts) {
                return Err(CacheError::RetriesExhausted {
                    row_id: self.row_id.clone(),
                    attempts: conflicts,
                });
            }
            debug!("eventfold-registry: {error}; refetching revision (attempt {conflicts})");

            *token = match cache.get(&self.row_id).await {
                Ok(current) => current.rev,
                Err(CacheError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            let delay = self.retry.delay(conflicts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

enum WriteRequest<S> {
    Persist { state: Arc<S>, seq: u64 },
    Flush(oneshot::Sender<()>),
}

/// Handle to the background task that performs cache writes.
///
/// Dispatch hands states over without waiting. Writes queued while an
/// earlier one is in flight are coalesced: only the newest state is written,
/// since it subsumes the others.
pub(crate) struct CacheWriter<S> {
    tx: mpsc::UnboundedSender<WriteRequest<S>>,
}

impl<S: State> CacheWriter<S> {
    pub(crate) fn spawn(
        guard: Arc<ConcurrencyGuard<S>>,
        faults: FaultReporter,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(guard, faults, rx));
        CacheWriter { tx }
    }

    pub(crate) fn persist(&self, state: Arc<S>, seq: u64) {
        if self.tx.send(WriteRequest::Persist { state, seq }).is_err() {
            debug!("eventfold-registry: cache writer stopped, dropping state at seq {seq}");
        }
    }

    /// Resolves once every state handed over before the call has been written
    /// (or has failed).
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer<S: State>(
    guard: Arc<ConcurrencyGuard<S>>,
    faults: FaultReporter,
    mut rx: mpsc::UnboundedReceiver<WriteRequest<S>>,
) {
    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut flushes = Vec::new();

        let mut next = Some(first);
        while let Some(request) = next {
            match request {
                WriteRequest::Persist { state, seq } => latest = Some((state, seq)),
                WriteRequest::Flush(ack) => flushes.push(ack),
            }
            next = rx.try_recv().ok();
        }

        if let Some((state, seq)) = latest
            && let Err(e) = guard.cache_state(state, seq).await
        {
            faults.report(Fault::CacheFailure {
                seq,
                message: e.to_string(),
            });
        }

        for ack in flushes {
            let _ = ack.send(());
        }
    }
}
