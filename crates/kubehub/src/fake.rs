//! In-memory cluster for tests and dry runs.
//!
//! Every kind lives in its own bucket: a map of current objects plus a broadcast
//! channel of changes. A stream subscribes to the channel first, then yields a
//! `Restarted` list of the bucket, then the live tail, so nothing applied while a
//! stream opens is lost (it may be seen twice, which watchers tolerate).

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::{stream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{Resource, ResourceExt};
use tidewatch_core::{selector, Error};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ClusterApi, ObjectEvent, WatchScope, WatchStream};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
enum Change<K> {
    Applied(K),
    Deleted(K),
    Fail(Error),
}

struct Bucket<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    tx: broadcast::Sender<Change<K>>,
}

impl<K> Bucket<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { objects: Mutex::new(BTreeMap::new()), tx }
    }

    fn key(obj: &K) -> (String, String) {
        (obj.namespace().unwrap_or_default(), obj.name_any())
    }

    fn apply(&self, obj: K) {
        lock(&self.objects).insert(Self::key(&obj), obj.clone());
        let _ = self.tx.send(Change::Applied(obj));
    }

    fn delete(&self, namespace: &str, name: &str) -> bool {
        let removed = lock(&self.objects).remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(obj) => {
                let _ = self.tx.send(Change::Deleted(obj));
                true
            }
            None => false,
        }
    }

    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects).get(&(namespace.to_string(), name.to_string())).cloned()
    }

    fn fail(&self, err: Error) {
        let _ = self.tx.send(Change::Fail(err));
    }

    fn stream(&self, scope: &WatchScope) -> WatchStream<K> {
        let rx = self.tx.subscribe();
        let initial: Vec<K> = lock(&self.objects).values().filter(|o| in_scope(*o, scope)).cloned().collect();
        let head = stream::once(async move { Ok(ObjectEvent::Restarted(initial)) });
        let scope = scope.clone();
        let tail = stream::unfold(Some(rx), move |state| {
            let scope = scope.clone();
            async move {
                let mut rx = state?;
                loop {
                    match rx.recv().await {
                        Ok(Change::Applied(o)) if in_scope(&o, &scope) => return Some((Ok(ObjectEvent::Applied(o)), Some(rx))),
                        Ok(Change::Deleted(o)) if in_scope(&o, &scope) => return Some((Ok(ObjectEvent::Deleted(o)), Some(rx))),
                        Ok(Change::Fail(e)) => return Some((Err(e), None)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(Error::TransientApi(format!("watch lagged by {n} changes"))), None))
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        head.chain(tail).boxed()
    }
}

fn in_scope<K: Resource>(obj: &K, scope: &WatchScope) -> bool {
    if let Some(ns) = scope.namespace.as_deref() {
        if obj.meta().namespace.as_deref() != Some(ns) {
            return false;
        }
    }
    match scope.labels.as_deref() {
        Some(q) => selector::query_matches(q, obj.labels()),
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FakeKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Pod,
    Event,
}

/// In-memory [`ClusterApi`].
pub struct FakeCluster {
    deployments: Bucket<Deployment>,
    daemonsets: Bucket<DaemonSet>,
    statefulsets: Bucket<StatefulSet>,
    replicasets: Bucket<ReplicaSet>,
    pods: Bucket<Pod>,
    events: Bucket<Event>,
    fault: Mutex<Option<Error>>,
    calls: Mutex<Vec<(FakeKind, Instant)>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            deployments: Bucket::new(),
            daemonsets: Bucket::new(),
            statefulsets: Bucket::new(),
            replicasets: Bucket::new(),
            pods: Bucket::new(),
            events: Bucket::new(),
            fault: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every subsequent call (stream opens and probes) with `err`; `None` heals.
    pub fn set_fault(&self, err: Option<Error>) {
        *lock(&self.fault) = err;
    }

    /// Break every stream that is currently open with `err`.
    pub fn fail_open_watches(&self, err: Error) {
        self.deployments.fail(err.clone());
        self.daemonsets.fail(err.clone());
        self.statefulsets.fail(err.clone());
        self.replicasets.fail(err.clone());
        self.pods.fail(err.clone());
        self.events.fail(err);
    }

    /// Number of stream opens for `kind` so far.
    pub fn watch_calls(&self, kind: FakeKind) -> usize {
        lock(&self.calls).iter().filter(|(k, _)| *k == kind).count()
    }

    /// Instants of every stream open for `kind`, oldest first.
    pub fn call_instants(&self, kind: FakeKind) -> Vec<Instant> {
        lock(&self.calls).iter().filter(|(k, _)| *k == kind).map(|(_, at)| *at).collect()
    }

    pub fn apply_deployment(&self, obj: Deployment) {
        self.deployments.apply(obj);
    }
    pub fn delete_deployment(&self, namespace: &str, name: &str) -> bool {
        self.deployments.delete(namespace, name)
    }
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.deployments.get(namespace, name)
    }

    pub fn apply_daemonset(&self, obj: DaemonSet) {
        self.daemonsets.apply(obj);
    }
    pub fn delete_daemonset(&self, namespace: &str, name: &str) -> bool {
        self.daemonsets.delete(namespace, name)
    }

    pub fn apply_statefulset(&self, obj: StatefulSet) {
        self.statefulsets.apply(obj);
    }
    pub fn delete_statefulset(&self, namespace: &str, name: &str) -> bool {
        self.statefulsets.delete(namespace, name)
    }

    pub fn apply_replicaset(&self, obj: ReplicaSet) {
        self.replicasets.apply(obj);
    }
    pub fn delete_replicaset(&self, namespace: &str, name: &str) -> bool {
        self.replicasets.delete(namespace, name)
    }

    pub fn apply_pod(&self, obj: Pod) {
        self.pods.apply(obj);
    }
    pub fn delete_pod(&self, namespace: &str, name: &str) -> bool {
        self.pods.delete(namespace, name)
    }
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.get(namespace, name)
    }

    /// Create or update an Event object (same name updates, like the apiserver).
    pub fn emit_event(&self, obj: Event) {
        self.events.apply(obj);
    }

    fn open<K>(&self, kind: FakeKind, bucket: &Bucket<K>, scope: &WatchScope) -> WatchStream<K>
    where
        K: Resource + Clone + Send + Sync + 'static,
    {
        lock(&self.calls).push((kind, Instant::now()));
        if let Some(err) = lock(&self.fault).clone() {
            debug!(?kind, error = %err, "fake cluster failing stream open");
            return stream::once(async move { Err(err) }).boxed();
        }
        bucket.stream(scope)
    }
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    fn deployments(&self, scope: &WatchScope) -> WatchStream<Deployment> {
        self.open(FakeKind::Deployment, &self.deployments, scope)
    }

    fn daemonsets(&self, scope: &WatchScope) -> WatchStream<DaemonSet> {
        self.open(FakeKind::DaemonSet, &self.daemonsets, scope)
    }

    fn statefulsets(&self, scope: &WatchScope) -> WatchStream<StatefulSet> {
        self.open(FakeKind::StatefulSet, &self.statefulsets, scope)
    }

    fn replicasets(&self, scope: &WatchScope) -> WatchStream<ReplicaSet> {
        self.open(FakeKind::ReplicaSet, &self.replicasets, scope)
    }

    fn pods(&self, scope: &WatchScope) -> WatchStream<Pod> {
        self.open(FakeKind::Pod, &self.pods, scope)
    }

    fn events(&self, scope: &WatchScope) -> WatchStream<Event> {
        self.open(FakeKind::Event, &self.events, scope)
    }

    async fn probe(&self) -> Result<(), Error> {
        match lock(&self.fault).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Object constructors for tests.
pub mod build {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use k8s_openapi::api::apps::v1::{
        DaemonSet, DaemonSetSpec, DaemonSetStatus, Deployment, DeploymentSpec, DeploymentStatus, ReplicaSet, ReplicaSetSpec,
        ReplicaSetStatus, StatefulSet, StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, Event, EventSource, ObjectReference, Pod, PodCondition, PodStatus,
        PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference, Time};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn meta(ns: &str, name: &str, pairs: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            uid: Some(format!("uid-{ns}-{name}")),
            labels: if pairs.is_empty() { None } else { Some(labels(pairs)) },
            creation_timestamp: Some(Time(Utc::now())),
            ..Default::default()
        }
    }

    fn owner(kind: &str, api_version: &str, ns: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{ns}-{name}"),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn template(pairs: &[(&str, &str)]) -> PodTemplateSpec {
        PodTemplateSpec { metadata: Some(ObjectMeta { labels: Some(labels(pairs)), ..Default::default() }), spec: None }
    }

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector { match_labels: if pairs.is_empty() { None } else { Some(labels(pairs)) }, match_expressions: None }
    }

    pub fn deployment(ns: &str, name: &str, generation: i64, replicas: i32, selector_labels: &[(&str, &str)]) -> Deployment {
        let mut m = meta(ns, name, selector_labels);
        m.generation = Some(generation);
        Deployment {
            metadata: m,
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: selector(selector_labels),
                template: template(selector_labels),
                ..Default::default()
            }),
            status: Some(DeploymentStatus { observed_generation: Some(generation - 1), ..Default::default() }),
        }
    }

    /// Mark the rollout of the deployment's current generation complete.
    pub fn settle_deployment(d: &mut Deployment) {
        let generation = d.metadata.generation.unwrap_or(0);
        let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        d.status = Some(DeploymentStatus {
            observed_generation: Some(generation),
            replicas: Some(replicas),
            updated_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        });
    }

    pub fn annotate(meta: &mut ObjectMeta, key: &str, value: &str) {
        meta.annotations.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
    }

    pub fn daemonset(ns: &str, name: &str, generation: i64, selector_labels: &[(&str, &str)]) -> DaemonSet {
        let mut m = meta(ns, name, selector_labels);
        m.generation = Some(generation);
        DaemonSet {
            metadata: m,
            spec: Some(DaemonSetSpec { selector: selector(selector_labels), template: template(selector_labels), ..Default::default() }),
            status: Some(DaemonSetStatus { observed_generation: Some(generation - 1), ..Default::default() }),
        }
    }

    pub fn statefulset(ns: &str, name: &str, generation: i64, replicas: i32, selector_labels: &[(&str, &str)]) -> StatefulSet {
        let mut m = meta(ns, name, selector_labels);
        m.generation = Some(generation);
        StatefulSet {
            metadata: m,
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                selector: selector(selector_labels),
                template: template(selector_labels),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus { observed_generation: Some(generation - 1), ..Default::default() }),
        }
    }

    /// The DaemonSet controller has observed the current generation and scheduled
    /// `desired` pods, `updated` of them on the new template.
    pub fn observe_daemonset(ds: &mut DaemonSet, desired: i32, updated: i32) {
        let st = ds.status.get_or_insert_with(Default::default);
        st.observed_generation = ds.metadata.generation;
        st.desired_number_scheduled = desired;
        st.current_number_scheduled = desired;
        st.updated_number_scheduled = Some(updated);
    }

    /// The StatefulSet controller has observed the current generation, rolling out
    /// `update_revision` with `updated` pods on it.
    pub fn observe_statefulset(sts: &mut StatefulSet, update_revision: &str, updated: i32) {
        let st = sts.status.get_or_insert_with(Default::default);
        st.observed_generation = sts.metadata.generation;
        st.update_revision = Some(update_revision.to_string());
        st.updated_replicas = Some(updated);
    }

    /// ReplicaSet whose selector (and labels) are `selector_labels`, optionally owned
    /// by the named Deployment.
    pub fn replicaset(
        ns: &str,
        name: &str,
        selector_labels: &[(&str, &str)],
        owner_deployment: Option<&str>,
        created: DateTime<Utc>,
    ) -> ReplicaSet {
        let mut m = meta(ns, name, selector_labels);
        m.creation_timestamp = Some(Time(created));
        if let Some(d) = owner_deployment {
            m.owner_references = Some(vec![owner("Deployment", "apps/v1", ns, d)]);
        }
        ReplicaSet {
            metadata: m,
            spec: Some(ReplicaSetSpec {
                replicas: Some(1),
                selector: selector(selector_labels),
                template: Some(template(selector_labels)),
                ..Default::default()
            }),
            status: Some(ReplicaSetStatus { replicas: 0, ..Default::default() }),
        }
    }

    pub fn pod(ns: &str, name: &str, pod_labels: &[(&str, &str)], phase: &str, owner_replicaset: Option<&str>) -> Pod {
        let mut m = meta(ns, name, pod_labels);
        if let Some(rs) = owner_replicaset {
            m.owner_references = Some(vec![owner("ReplicaSet", "apps/v1", ns, rs)]);
        }
        Pod { metadata: m, spec: None, status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }) }
    }

    pub fn set_phase(pod: &mut Pod, phase: &str) {
        pod.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
    }

    /// Report a Ready condition explicitly.
    pub fn set_ready(pod: &mut Pod, ready: bool) {
        let status = pod.status.get_or_insert_with(Default::default);
        status.conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]);
    }

    pub fn set_crash_loop(pod: &mut Pod) {
        let status = pod.status.get_or_insert_with(Default::default);
        status.container_statuses = Some(vec![ContainerStatus {
            name: "main".to_string(),
            ready: false,
            restart_count: 3,
            image: "app:latest".to_string(),
            image_id: String::new(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting { reason: Some("CrashLoopBackOff".to_string()), message: None }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    pub fn event(
        ns: &str,
        name: &str,
        involved_kind: &str,
        involved_name: &str,
        reason: &str,
        type_: &str,
        first_seen: DateTime<Utc>,
    ) -> Event {
        Event {
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(ns.to_string()), ..Default::default() },
            involved_object: ObjectReference {
                kind: Some(involved_kind.to_string()),
                name: Some(involved_name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(format!("{reason} on {involved_kind}/{involved_name}")),
            type_: Some(type_.to_string()),
            first_timestamp: Some(Time(first_seen)),
            last_timestamp: Some(Time(first_seen)),
            count: Some(1),
            source: Some(EventSource { component: Some("kubelet".to_string()), host: None }),
            ..Default::default()
        }
    }
}
