//! Events manager: one upstream Event watch per namespace scope, fanned out to
//! per-object subscribers through bounded drop-oldest queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashMap;
use tidewatch_core::{Backoff, DeploymentNarrative, Error, EventRecord};
use tidewatch_kubehub::{convert, ObjectEvent, ObjectKey, WatchScope};
use tidewatch_store::Slot;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Shared;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(EventRecord),
    /// `dropped` events were discarded because the subscriber fell behind.
    Gap { dropped: u64 },
    /// The upstream watch reconnected; events in the outage may be missing.
    Resync,
}

struct QueueState {
    buf: VecDeque<Delivery>,
    dropped: u64,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    cap: usize,
}

impl SubscriberQueue {
    fn new(cap: usize) -> Self {
        Self { state: Mutex::new(QueueState { buf: VecDeque::new(), dropped: 0, closed: false }), notify: Notify::new(), cap: cap.max(1) }
    }

    fn push(&self, d: Delivery) {
        {
            let mut st = lock(&self.state);
            if st.closed {
                return;
            }
            if st.buf.len() >= self.cap {
                st.buf.pop_front();
                st.dropped += 1;
                counter!("events_dropped_total", 1u64);
            }
            st.buf.push_back(d);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        {
            let mut st = lock(&self.state);
            st.closed = true;
            st.buf.clear();
            st.dropped = 0;
        }
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<Delivery> {
        loop {
            {
                let mut st = lock(&self.state);
                if st.closed {
                    return None;
                }
                if st.dropped > 0 {
                    let dropped = std::mem::take(&mut st.dropped);
                    return Some(Delivery::Gap { dropped });
                }
                if let Some(d) = st.buf.pop_front() {
                    return Some(d);
                }
            }
            self.notify.notified().await;
        }
    }
}

/// How long an event's routed state is remembered, matching the apiserver's
/// default event TTL. A re-list older than this may deliver an event again.
const ROUTED_RETENTION: Duration = Duration::from_secs(3600);

struct Recent {
    received: Instant,
    record: EventRecord,
}

/// Upstream state of an event when it was last routed.
struct Routed {
    last_seen: DateTime<Utc>,
    count: u32,
    at: Instant,
}

type EventId = (ObjectKey, String);

#[derive(Default)]
struct Routing {
    subscribers: FxHashMap<ObjectKey, Vec<(u64, Arc<SubscriberQueue>)>>,
    recent: FxHashMap<ObjectKey, VecDeque<Recent>>,
    /// `recent` keys in dispatch order.
    recent_order: VecDeque<(Instant, ObjectKey)>,
    routed: FxHashMap<EventId, Routed>,
    /// `routed` keys in dispatch order.
    routed_order: VecDeque<(Instant, EventId)>,
}

impl Routing {
    fn already_routed(&self, key: &ObjectKey, record: &EventRecord) -> bool {
        self.routed
            .get(&(key.clone(), record.name.clone()))
            .is_some_and(|r| r.last_seen == record.last_seen && r.count == record.count)
    }

    /// Drop replay and routed state that aged out. Both indexes are time ordered,
    /// so this only looks at expired entries.
    fn expire(&mut self, now: Instant, window: Duration) {
        while self.recent_order.front().is_some_and(|(at, _)| now.duration_since(*at) > window) {
            let Some((_, key)) = self.recent_order.pop_front() else { break };
            if let Some(recent) = self.recent.get_mut(&key) {
                prune(recent, window);
                if recent.is_empty() {
                    self.recent.remove(&key);
                }
            }
        }
        let retention = window.max(ROUTED_RETENTION);
        while self.routed_order.front().is_some_and(|(at, _)| now.duration_since(*at) > retention) {
            let Some((at, id)) = self.routed_order.pop_front() else { break };
            // A later dispatch of the same event refreshed it.
            if self.routed.get(&id).is_some_and(|r| r.at == at) {
                self.routed.remove(&id);
            }
        }
    }
}

struct Inner {
    routing: Mutex<Routing>,
    next_id: AtomicU64,
    replay_window: Duration,
    buffer: usize,
}

/// Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct EventsManager {
    inner: Arc<Inner>,
}

/// Receive side of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    key: ObjectKey,
    queue: Arc<SubscriberQueue>,
    manager: EventsManager,
}

impl Subscription {
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Next delivery, or `None` once unsubscribed.
    pub async fn recv(&self) -> Option<Delivery> {
        self.queue.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.manager.remove(&self.key, self.id);
        self.queue.close();
    }
}

impl EventsManager {
    pub fn new(replay_window: Duration, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                routing: Mutex::new(Routing::default()),
                next_id: AtomicU64::new(1),
                replay_window,
                buffer: buffer.max(1),
            }),
        }
    }

    /// Subscribe to events whose involved object is `(namespace, kind, name)`.
    /// Events seen within the replay window are delivered first.
    pub fn subscribe(&self, namespace: &str, kind: &str, name: &str) -> Subscription {
        let key = ObjectKey::new(namespace, kind, name);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.inner.buffer));
        {
            let mut routing = lock(&self.inner.routing);
            let cutoff = Utc::now() - chrono::Duration::from_std(self.inner.replay_window).unwrap_or(chrono::Duration::zero());
            if let Some(recent) = routing.recent.get_mut(&key) {
                prune(recent, self.inner.replay_window);
                for r in recent.iter().filter(|r| r.record.last_seen >= cutoff) {
                    queue.push(Delivery::Event(r.record.clone()));
                }
            }
            routing.subscribers.entry(key.clone()).or_default().push((id, Arc::clone(&queue)));
        }
        debug!(object = %key, id, "events subscription opened");
        Subscription { id, key, queue, manager: self.clone() }
    }

    fn remove(&self, key: &ObjectKey, id: u64) {
        let mut routing = lock(&self.inner.routing);
        if let Some(subs) = routing.subscribers.get_mut(key) {
            subs.retain(|(sid, _)| *sid != id);
            if subs.is_empty() {
                routing.subscribers.remove(key);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.routing).subscribers.values().map(Vec::len).sum()
    }

    /// Route one event to its subscribers and remember it for late subscribers.
    pub fn dispatch(&self, key: ObjectKey, record: EventRecord) {
        let mut routing = lock(&self.inner.routing);
        self.route(&mut routing, key, record);
    }

    /// Route an event that arrived in a full list. A reconnect lists every event
    /// again, so one whose upstream count and last timestamp are unchanged since
    /// it was last routed is skipped. Returns whether it was routed.
    pub fn dispatch_relisted(&self, key: ObjectKey, record: EventRecord) -> bool {
        let mut routing = lock(&self.inner.routing);
        if routing.already_routed(&key, &record) {
            counter!("events_relist_skipped_total", 1u64);
            return false;
        }
        self.route(&mut routing, key, record);
        true
    }

    fn route(&self, routing: &mut Routing, key: ObjectKey, record: EventRecord) {
        let now = Instant::now();
        if let Some(subs) = routing.subscribers.get(&key) {
            for (_, q) in subs.iter() {
                q.push(Delivery::Event(record.clone()));
            }
        }
        let id = (key.clone(), record.name.clone());
        routing.routed.insert(id.clone(), Routed { last_seen: record.last_seen, count: record.count, at: now });
        routing.routed_order.push_back((now, id));

        let recent = routing.recent.entry(key.clone()).or_default();
        prune(recent, self.inner.replay_window);
        recent.push_back(Recent { received: now, record });
        routing.recent_order.push_back((now, key));
        routing.expire(now, self.inner.replay_window);
    }

    fn broadcast(&self, d: Delivery) {
        let routing = lock(&self.inner.routing);
        for subs in routing.subscribers.values() {
            for (_, q) in subs.iter() {
                q.push(d.clone());
            }
        }
    }

    /// Start one upstream watch per scope. Every task stops when `token` fires.
    pub(crate) fn serve(&self, shared: &Arc<Shared>, scopes: Vec<WatchScope>, token: CancellationToken) {
        for scope in scopes {
            let me = self.clone();
            let shared = Arc::clone(shared);
            let token = token.clone();
            shared.tracker.clone().spawn(async move { me.upstream(shared, scope, token).await });
        }
    }

    async fn upstream(&self, shared: Arc<Shared>, scope: WatchScope, token: CancellationToken) {
        let mut backoff = Backoff::new(shared.config.backoff);
        let mut reconnecting = false;
        info!(ns = ?scope.namespace, "event watch started");
        loop {
            let mut stream = shared.api.events(&scope);
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(ObjectEvent::Restarted(list))) => {
                        backoff.reset();
                        if reconnecting {
                            info!(ns = ?scope.namespace, "event watch resynced");
                            self.broadcast(Delivery::Resync);
                            reconnecting = false;
                        }
                        let now = Utc::now();
                        let mut records: Vec<_> = list.iter().filter_map(|e| convert::event_record(e, now)).collect();
                        records.sort_by(|a, b| a.1.first_seen.cmp(&b.1.first_seen));
                        let listed = records.len();
                        let routed = records.into_iter().filter(|(key, rec)| self.dispatch_relisted(key.clone(), rec.clone())).count();
                        debug!(ns = ?scope.namespace, listed, routed, "event list routed");
                    }
                    Some(Ok(ObjectEvent::Applied(ev))) => {
                        if let Some((key, rec)) = convert::event_record(&ev, Utc::now()) {
                            self.dispatch(key, rec);
                        }
                    }
                    Some(Ok(ObjectEvent::Deleted(_))) => {}
                    Some(Err(e @ Error::PermanentApi { .. })) => {
                        // Nothing to flag: events belong to no single narrative. Keep trying slowly.
                        error!(ns = ?scope.namespace, error = %e, "event watch refused");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(ns = ?scope.namespace, error = %e, "event watch failed; reconnecting");
                        break;
                    }
                    None => {
                        debug!(ns = ?scope.namespace, "event watch ended; reconnecting");
                        break;
                    }
                }
            }
            reconnecting = true;
            counter!("watch_reconnects_total", 1u64, "kind" => "Event");
            if backoff.wait(&token).await.is_err() {
                return;
            }
        }
    }
}

fn prune(recent: &mut VecDeque<Recent>, window: Duration) {
    while recent.front().is_some_and(|r| r.received.elapsed() > window) {
        recent.pop_front();
    }
}

/// Where a followed object's events land in the narrative.
#[derive(Debug, Clone)]
pub(crate) enum EventTarget {
    Root { application: String },
    ReplicaSet { application: String, name: String },
    Pod { application: String, name: String },
}

impl EventTarget {
    fn record(&self, n: &mut DeploymentNarrative, ev: EventRecord) -> bool {
        match self {
            EventTarget::Root { application } => n.application_mut(application).root_events.insert(ev),
            EventTarget::ReplicaSet { application, name } => n.application_mut(application).record_replicaset_event(name, ev),
            EventTarget::Pod { application, name } => n.application_mut(application).record_pod_event(name, ev),
        }
    }
}

/// Follow one object's events into `slot` until `token` fires or the narrative seals.
pub(crate) fn follow(shared: &Arc<Shared>, key: ObjectKey, target: EventTarget, slot: Slot, token: CancellationToken) {
    let sub = shared.events.subscribe(&key.namespace, &key.kind, &key.name);
    let registry = shared.registry.clone();
    shared.tracker.spawn(async move {
        loop {
            let delivery = tokio::select! {
                _ = token.cancelled() => break,
                d = sub.recv() => d,
            };
            match delivery {
                Some(Delivery::Event(ev)) => {
                    if registry.apply(&slot, |n| target.record(n, ev)).await.is_none() {
                        break;
                    }
                }
                Some(Delivery::Gap { dropped }) => {
                    warn!(object = %sub.key(), dropped, "event subscriber fell behind");
                }
                Some(Delivery::Resync) => debug!(object = %sub.key(), "event stream resynced"),
                None => break,
            }
        }
        sub.unsubscribe();
    });
}
