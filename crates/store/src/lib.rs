//! Tidewatch deployment registry.
//!
//! `identity -> entry`. The outer map sits behind a read-write lock; each entry has
//! its own async mutex so one narrative has one writer while others proceed in
//! parallel. After every mutation the entry publishes an immutable snapshot
//! (ArcSwap) and bumps a version (watch channel). Writes to storage go through a
//! single coalescing writer task; handing a write over never waits on storage.

#![forbid(unsafe_code)]

mod writer;

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tidewatch_core::{BackoffPolicy, DeploymentNarrative, Error, Identity, RolloutTarget, Status};
use tidewatch_persist::DeploymentStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use writer::{WriteOp, WriterState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How long a sealed narrative stays readable before eviction.
    pub linger: Duration,
    /// Most identities written per writer pass.
    pub write_queue: usize,
    pub backoff: BackoffPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { linger: Duration::from_secs(60), write_queue: 1024, backoff: BackoffPolicy::default() }
    }
}

/// What a root manager knows when it opens a narrative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub kind: String,
    pub target: RolloutTarget,
    pub deadline: Duration,
    /// The object was deleted and re-created: a sealed narrative under the same
    /// identity is replaced instead of joined, and so is its stored row.
    pub replace_sealed: bool,
}

struct Entry {
    narrative: tokio::sync::Mutex<DeploymentNarrative>,
    published: ArcSwap<DeploymentNarrative>,
    version: watch::Sender<u64>,
}

impl Entry {
    fn new(narrative: DeploymentNarrative) -> Self {
        let (version, _) = watch::channel(0u64);
        Self { published: ArcSwap::from_pointee(narrative.clone()), narrative: tokio::sync::Mutex::new(narrative), version }
    }

    /// Caller holds the narrative guard, so versions are strictly increasing.
    fn publish(&self, current: &DeploymentNarrative) -> Arc<DeploymentNarrative> {
        let snap = Arc::new(current.clone());
        self.published.store(Arc::clone(&snap));
        self.version.send_modify(|v| *v += 1);
        snap
    }
}

/// Handle to one narrative, passed down the watcher tree.
#[derive(Clone)]
pub struct Slot {
    identity: Identity,
    entry: Arc<Entry>,
}

impl Slot {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Latest published snapshot (cheap, shared).
    pub fn current(&self) -> Arc<DeploymentNarrative> {
        self.entry.published.load_full()
    }

    pub fn is_sealed(&self) -> bool {
        self.current().is_sealed()
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("identity", &self.identity).finish()
    }
}

struct Inner {
    entries: RwLock<FxHashMap<Identity, Arc<Entry>>>,
    writes: Arc<WriterState>,
    writer: Mutex<Option<JoinHandle<()>>>,
    evictions: TaskTracker,
    closing: CancellationToken,
    linger: Duration,
}

/// Injected everywhere; clones share one index.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Build the registry and spawn its storage writer on the current runtime.
    pub fn new(store: Arc<dyn DeploymentStore>, config: RegistryConfig) -> Self {
        let writes = Arc::new(WriterState::new());
        let closing = CancellationToken::new();
        let writer = tokio::spawn(writer::run(store, Arc::clone(&writes), config.backoff, config.write_queue.max(1), closing.clone()));
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(FxHashMap::default()),
                writes,
                writer: Mutex::new(Some(writer)),
                evictions: TaskTracker::new(),
                closing,
                linger: config.linger,
            }),
        }
    }

    fn entries_read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<Identity, Arc<Entry>>> {
        self.inner.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<Identity, Arc<Entry>>> {
        self.inner.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, op: WriteOp) {
        if self.inner.closing.is_cancelled() {
            debug!("registry closed; dropping storage write");
            return;
        }
        self.inner.writes.submit(op);
    }

    /// Create the narrative for `identity`, or join the one that already exists.
    /// Returns `true` when this call created it.
    pub async fn open(&self, identity: Identity, params: OpenParams) -> (Slot, bool) {
        let joinable = |e: &Arc<Entry>| !(params.replace_sealed && e.published.load().is_sealed());
        let existing = self.entries_read().get(&identity).filter(|e| joinable(e)).cloned();
        if let Some(entry) = existing {
            return (Slot { identity, entry }, false);
        }
        let (entry, created) = {
            let mut map = self.entries_write();
            match map.get(&identity) {
                Some(existing) if joinable(existing) => {
                    let conflict = Error::RegistryConflict(identity.to_string());
                    debug!(error = %conflict, "lost open race; joining winner");
                    (Arc::clone(existing), false)
                }
                _ => {
                    let desired = params.target.desired.unwrap_or(0);
                    let mut n = DeploymentNarrative::new(identity.clone(), params.kind.clone(), desired, params.deadline, Utc::now());
                    n.target = params.target.clone();
                    let entry = Arc::new(Entry::new(n));
                    map.insert(identity.clone(), Arc::clone(&entry));
                    gauge!("registry_entries", map.len() as f64);
                    (entry, true)
                }
            }
        };
        if created {
            counter!("narratives_opened_total", 1u64);
            let snap = entry.published.load_full();
            // Storage may still hold the deleted object's completed row even after
            // the in-memory entry was evicted.
            if params.replace_sealed {
                info!(%identity, "narrative reopened for a re-created object");
                self.submit(WriteOp::Reset(snap));
            } else {
                info!(%identity, "narrative opened");
                self.submit(WriteOp::Upsert(snap));
            }
        }
        (Slot { identity, entry }, created)
    }

    pub fn get(&self, identity: &Identity) -> Option<Slot> {
        self.entries_read().get(identity).map(|entry| Slot { identity: identity.clone(), entry: Arc::clone(entry) })
    }

    /// Run `mutation` under the narrative's write guard. Sealed narratives are left
    /// untouched and `None` is returned.
    pub async fn apply<F, R>(&self, slot: &Slot, mutation: F) -> Option<R>
    where
        F: FnOnce(&mut DeploymentNarrative) -> R,
    {
        let mut guard = slot.entry.narrative.lock().await;
        if guard.is_sealed() {
            return None;
        }
        let out = mutation(&mut guard);
        let snap = slot.entry.publish(&guard);
        self.submit(WriteOp::Upsert(snap));
        Some(out)
    }

    /// Move the narrative to a terminal state, hand it to storage and schedule its
    /// eviction. Returns `false` when it was already sealed.
    pub async fn seal(&self, slot: &Slot, status: Status, reason: Option<String>) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let mut guard = slot.entry.narrative.lock().await;
        let now = Utc::now();
        if !guard.transition(status, reason, now) {
            return false;
        }
        let snap = slot.entry.publish(&guard);
        self.submit(WriteOp::Upsert(snap));
        self.submit(WriteOp::Complete { identity: slot.identity.clone(), status, ended_at: now });
        let reason = guard.status_reason.clone().unwrap_or_default();
        drop(guard);
        counter!("narratives_sealed_total", 1u64, "status" => status.as_str());
        info!(identity = %slot.identity, %status, %reason, "narrative sealed");
        self.schedule_eviction(slot);
        true
    }

    fn schedule_eviction(&self, slot: &Slot) {
        let registry = self.clone();
        let identity = slot.identity.clone();
        let entry = Arc::clone(&slot.entry);
        let linger = self.inner.linger;
        let closing = self.inner.closing.clone();
        self.inner.evictions.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(linger) => {}
                _ = closing.cancelled() => return,
            }
            let mut map = registry.entries_write();
            if map.get(&identity).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                map.remove(&identity);
                gauge!("registry_entries", map.len() as f64);
                debug!(%identity, "narrative evicted");
            }
        });
    }

    /// Deep copy of the latest published state.
    pub fn snapshot(&self, identity: &Identity) -> Option<DeploymentNarrative> {
        self.entries_read().get(identity).map(|e| (*e.published.load_full()).clone())
    }

    /// Version receiver; bumps after every published mutation.
    pub fn changes(&self, slot: &Slot) -> watch::Receiver<u64> {
        slot.entry.version.subscribe()
    }

    /// Identities of narratives not yet sealed.
    pub fn active(&self) -> Vec<Identity> {
        let mut out: Vec<Identity> =
            self.entries_read().iter().filter(|(_, e)| !e.published.load().is_sealed()).map(|(id, _)| id.clone()).collect();
        out.sort();
        out
    }

    /// Unsealed narratives of the same application as `identity`, any generation.
    pub fn in_flight_for(&self, identity: &Identity) -> Vec<Slot> {
        self.entries_read()
            .iter()
            .filter(|(id, e)| id.same_application(identity) && !e.published.load().is_sealed())
            .map(|(id, e)| Slot { identity: id.clone(), entry: Arc::clone(e) })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every write submitted so far has reached storage (or failed for good).
    pub async fn flush(&self) {
        if self.inner.closing.is_cancelled() {
            return;
        }
        let mut idle = self.inner.writes.idle();
        tokio::select! {
            _ = idle.wait_for(|done| *done) => {}
            _ = self.inner.closing.cancelled() => {}
        }
    }

    /// Drain pending writes, stop the writer and cancel pending evictions.
    /// No storage write is issued after this returns. Idempotent.
    pub async fn close(&self) {
        self.inner.closing.cancel();
        self.inner.evictions.close();
        let writer = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        self.inner.evictions.wait().await;
    }
}
