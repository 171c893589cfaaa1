//! Storage writer: a coalescing queue drained on a short ticker.
//!
//! Submitting never waits on storage. The queue holds at most one pending write per
//! identity, so its size is bounded by the narratives in memory no matter how long
//! storage is unavailable. A transiently failing identity is parked with its own
//! backoff and retried on a later pass while the others keep draining.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tidewatch_core::{Backoff, BackoffPolicy, DeploymentNarrative, Error, Identity, Status};
use tidewatch_persist::DeploymentStore;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) enum WriteOp {
    Upsert(Arc<DeploymentNarrative>),
    /// Replace whatever storage holds for the identity, completion included.
    Reset(Arc<DeploymentNarrative>),
    Complete { identity: Identity, status: Status, ended_at: DateTime<Utc> },
}

#[derive(Default)]
pub(crate) struct PendingWrite {
    upsert: Option<Arc<DeploymentNarrative>>,
    reset: bool,
    complete: Option<(Status, DateTime<Utc>)>,
}

impl PendingWrite {
    fn is_empty(&self) -> bool {
        self.upsert.is_none() && self.complete.is_none()
    }
}

/// Coalescing queue keyed by identity with FIFO order across identities.
/// A later upsert replaces an earlier one; per identity the upsert is always
/// written before the completion, which is the order they were submitted in.
#[derive(Default)]
pub(crate) struct WriteQueue {
    map: FxHashMap<Identity, PendingWrite>,
    order: VecDeque<Identity>,
    coalesced: u64,
}

impl WriteQueue {
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn coalesced(&self) -> u64 {
        self.coalesced
    }

    fn slot(&mut self, identity: &Identity) -> &mut PendingWrite {
        if !self.map.contains_key(identity) {
            self.order.push_back(identity.clone());
        }
        self.map.entry(identity.clone()).or_default()
    }

    pub(crate) fn push(&mut self, op: WriteOp) {
        match op {
            WriteOp::Upsert(n) => {
                let identity = n.identity.clone();
                if self.slot(&identity).upsert.replace(n).is_some() {
                    self.coalesced += 1;
                }
            }
            WriteOp::Reset(n) => {
                let identity = n.identity.clone();
                // Anything still pending belongs to the previous incarnation.
                *self.slot(&identity) = PendingWrite { upsert: Some(n), reset: true, complete: None };
            }
            WriteOp::Complete { identity, status, ended_at } => {
                self.slot(&identity).complete.get_or_insert((status, ended_at));
            }
        }
    }

    /// Put back what a pass could not write. Newer pending state wins; a pending
    /// reset discards the failed write altogether.
    fn requeue(&mut self, identity: Identity, failed: PendingWrite) {
        if failed.is_empty() {
            return;
        }
        let pending = self.slot(&identity);
        if pending.reset {
            return;
        }
        pending.reset |= failed.reset;
        if pending.upsert.is_none() {
            pending.upsert = failed.upsert;
        }
        if failed.complete.is_some() {
            pending.complete = failed.complete;
        }
    }

    /// Up to `limit` writes whose identity is not parked, in FIFO order.
    fn take_due<F>(&mut self, limit: usize, due: F) -> Vec<(Identity, PendingWrite)>
    where
        F: Fn(&Identity) -> bool,
    {
        let mut out = Vec::new();
        let mut kept = VecDeque::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if out.len() >= limit || !due(&id) {
                kept.push_back(id);
                continue;
            }
            if let Some(w) = self.map.remove(&id) {
                out.push((id, w));
            }
        }
        self.order = kept;
        out
    }
}

/// State shared between the registry (producer) and the writer task.
pub(crate) struct WriterState {
    queue: Mutex<WriteQueue>,
    wake: Notify,
    /// `true` while nothing is queued or being written.
    idle: watch::Sender<bool>,
}

impl WriterState {
    pub(crate) fn new() -> Self {
        let (idle, _) = watch::channel(true);
        Self { queue: Mutex::new(WriteQueue::default()), wake: Notify::new(), idle }
    }

    fn queue(&self) -> MutexGuard<'_, WriteQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never blocks on storage.
    pub(crate) fn submit(&self, op: WriteOp) {
        {
            let mut q = self.queue();
            q.push(op);
            self.idle.send_replace(false);
            gauge!("registry_pending_writes", q.len() as f64);
        }
        self.wake.notify_one();
    }

    pub(crate) fn idle(&self) -> watch::Receiver<bool> {
        self.wake.notify_one();
        self.idle.subscribe()
    }

    fn settle(&self) {
        let q = self.queue();
        if q.len() == 0 {
            self.idle.send_replace(true);
        }
    }
}

enum Outcome {
    Written,
    Retry,
    Dropped,
}

pub(crate) async fn run(
    store: Arc<dyn DeploymentStore>,
    state: Arc<WriterState>,
    policy: BackoffPolicy,
    batch: usize,
    closing: CancellationToken,
) {
    let mut parked: FxHashMap<Identity, (Backoff, Instant)> = FxHashMap::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(8));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            _ = state.wake.notified() => {}
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let due = state.queue().take_due(batch, |id| parked.get(id).map_or(true, |(_, at)| *at <= now));
        for (identity, w) in due {
            let (outcome, rest) = write(&store, &identity, w).await;
            match outcome {
                Outcome::Retry => {
                    let (backoff, at) = parked.entry(identity.clone()).or_insert_with(|| (Backoff::new(policy), now));
                    let delay = backoff.next_delay().unwrap_or(policy.cap);
                    *at = Instant::now() + delay;
                    debug!(%identity, ?delay, "storage write parked");
                    state.queue().requeue(identity, rest);
                }
                Outcome::Written | Outcome::Dropped => {
                    parked.remove(&identity);
                }
            }
        }
        state.settle();
    }

    // Final pass: everything still queued gets one attempt, parked or not.
    let remaining = state.queue().take_due(usize::MAX, |_| true);
    for (identity, w) in remaining {
        if let (Outcome::Retry, _) = write(&store, &identity, w).await {
            warn!(%identity, "dropping storage write during shutdown");
        }
    }
    state.idle.send_replace(true);
    info!(coalesced = state.queue().coalesced(), "storage writer stopped");
}

/// Write one identity's pending state. On a transient failure the unwritten part
/// is handed back.
async fn write(store: &Arc<dyn DeploymentStore>, identity: &Identity, mut w: PendingWrite) -> (Outcome, PendingWrite) {
    if let Some(n) = w.upsert.take() {
        let reset = w.reset;
        let op = if reset { "reset" } else { "upsert" };
        let res = timed(op, || async {
            if reset {
                store.reset_deployment(&n).await
            } else {
                store.upsert_deployment(&n).await
            }
        })
        .await;
        match classify(identity, op, res) {
            Outcome::Retry => {
                w.upsert = Some(n);
                return (Outcome::Retry, w);
            }
            Outcome::Written | Outcome::Dropped => w.reset = false,
        }
    }
    if let Some((status, ended_at)) = w.complete.take() {
        let res = timed("complete", || store.complete_deployment(identity, status, ended_at)).await;
        if let Outcome::Retry = classify(identity, "complete", res) {
            w.complete = Some((status, ended_at));
            return (Outcome::Retry, w);
        }
    }
    (Outcome::Written, w)
}

async fn timed<F, Fut>(op: &'static str, call: F) -> tidewatch_core::Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = tidewatch_core::Result<()>>,
{
    let started = Instant::now();
    let res = call().await;
    if res.is_ok() {
        histogram!("registry_write_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
    }
    res
}

fn classify(identity: &Identity, op: &'static str, res: tidewatch_core::Result<()>) -> Outcome {
    match res {
        Ok(()) => Outcome::Written,
        Err(e @ Error::StorageTransient(_)) => {
            warn!(%identity, op, error = %e, "storage write failed; will retry");
            counter!("storage_transient_errors_total", 1u64);
            Outcome::Retry
        }
        Err(e) => {
            error!(%identity, op, error = %e, "storage write failed permanently");
            counter!("storage_permanent_errors_total", 1u64);
            Outcome::Dropped
        }
    }
}
