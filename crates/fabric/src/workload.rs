//! What a root manager needs to know about the kind it watches.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::Resource;
use tidewatch_core::{LabelSelector, RolloutTarget};
use tidewatch_kubehub::{convert, ClusterApi, WatchScope, WatchStream};
use tokio::sync::mpsc;

use crate::root::RootManager;
use crate::WatchRequest;

/// Which manager a root hands its children to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ReplicaSets,
    Pods,
}

/// Capability set of a root workload kind. New kinds are additive: implement this
/// and start a [`RootManager`] for it.
pub trait Workload: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    const KIND: &'static str;

    fn watch_roots(api: &dyn ClusterApi, scope: &WatchScope) -> WatchStream<Self>;

    /// Selector children are matched with.
    fn selector(&self) -> LabelSelector;

    fn generation(&self) -> Option<i64> {
        self.meta().generation
    }

    /// Desired and updated replicas as far as the controller has confirmed them
    /// for the current generation.
    fn rollout_target(&self) -> RolloutTarget;

    /// The controller reports the current generation fully rolled out.
    fn is_settled(&self) -> bool;

    fn child_route() -> Route;
}

pub type Deployments = RootManager<Deployment>;
pub type DaemonSets = RootManager<DaemonSet>;
pub type StatefulSets = RootManager<StatefulSet>;

fn spec_replicas(replicas: Option<i32>) -> i32 {
    replicas.unwrap_or(1)
}

fn observed(generation: Option<i64>, observed: Option<i64>) -> bool {
    matches!((generation, observed), (Some(g), Some(o)) if o >= g)
}

impl Workload for Deployment {
    const KIND: &'static str = "Deployment";

    fn watch_roots(api: &dyn ClusterApi, scope: &WatchScope) -> WatchStream<Self> {
        api.deployments(scope)
    }

    fn selector(&self) -> LabelSelector {
        self.spec.as_ref().map(|s| convert::selector_from_k8s(&s.selector)).unwrap_or_default()
    }

    /// Pods are judged through the current ReplicaSet, so the spec is enough.
    fn rollout_target(&self) -> RolloutTarget {
        RolloutTarget::desired(spec_replicas(self.spec.as_ref().and_then(|s| s.replicas)))
    }

    fn is_settled(&self) -> bool {
        let Some(st) = self.status.as_ref() else { return false };
        let desired = spec_replicas(self.spec.as_ref().and_then(|s| s.replicas));
        observed(self.metadata.generation, st.observed_generation)
            && st.updated_replicas.unwrap_or(0) == desired
            && st.ready_replicas.unwrap_or(0) == desired
            && st.replicas.unwrap_or(0) == desired
    }

    fn child_route() -> Route {
        Route::ReplicaSets
    }
}

impl Workload for DaemonSet {
    const KIND: &'static str = "DaemonSet";

    fn watch_roots(api: &dyn ClusterApi, scope: &WatchScope) -> WatchStream<Self> {
        api.daemonsets(scope)
    }

    fn selector(&self) -> LabelSelector {
        self.spec.as_ref().map(|s| convert::selector_from_k8s(&s.selector)).unwrap_or_default()
    }

    /// `desiredNumberScheduled` is only meaningful once the controller has observed
    /// this generation and found at least one node for it.
    fn rollout_target(&self) -> RolloutTarget {
        match self.status.as_ref() {
            Some(st) if observed(self.metadata.generation, st.observed_generation) && st.desired_number_scheduled > 0 => RolloutTarget {
                desired: Some(st.desired_number_scheduled),
                updated: Some(st.updated_number_scheduled.unwrap_or(0)),
                update_revision: None,
            },
            _ => RolloutTarget::default(),
        }
    }

    fn is_settled(&self) -> bool {
        let Some(st) = self.status.as_ref() else { return false };
        observed(self.metadata.generation, st.observed_generation)
            && st.updated_number_scheduled.unwrap_or(0) == st.desired_number_scheduled
            && st.number_ready == st.desired_number_scheduled
    }

    fn child_route() -> Route {
        Route::Pods
    }
}

impl Workload for StatefulSet {
    const KIND: &'static str = "StatefulSet";

    fn watch_roots(api: &dyn ClusterApi, scope: &WatchScope) -> WatchStream<Self> {
        api.statefulsets(scope)
    }

    fn selector(&self) -> LabelSelector {
        self.spec.as_ref().map(|s| convert::selector_from_k8s(&s.selector)).unwrap_or_default()
    }

    /// Pods are told apart by revision, so nothing counts until the controller has
    /// observed the generation and named its update revision.
    fn rollout_target(&self) -> RolloutTarget {
        match self.status.as_ref() {
            Some(st) if observed(self.metadata.generation, st.observed_generation) && st.update_revision.is_some() => RolloutTarget {
                desired: Some(spec_replicas(self.spec.as_ref().and_then(|s| s.replicas))),
                updated: Some(st.updated_replicas.unwrap_or(0)),
                update_revision: st.update_revision.clone(),
            },
            _ => RolloutTarget::default(),
        }
    }

    fn is_settled(&self) -> bool {
        let Some(st) = self.status.as_ref() else { return false };
        let desired = spec_replicas(self.spec.as_ref().and_then(|s| s.replicas));
        let revision_done = match (&st.current_revision, &st.update_revision) {
            (Some(c), Some(u)) => c == u,
            _ => true,
        };
        observed(self.metadata.generation, st.observed_generation)
            && revision_done
            && st.ready_replicas.unwrap_or(0) == desired
            && st.updated_replicas.unwrap_or(0) == desired
    }

    fn child_route() -> Route {
        Route::Pods
    }
}

/// Inbound channels of the child managers.
#[derive(Clone)]
pub(crate) struct Routes {
    pub(crate) replicasets: mpsc::Sender<WatchRequest>,
    pub(crate) pods: mpsc::Sender<WatchRequest>,
}

impl Routes {
    pub(crate) fn sender(&self, route: Route) -> &mpsc::Sender<WatchRequest> {
        match route {
            Route::ReplicaSets => &self.replicasets,
            Route::Pods => &self.pods,
        }
    }
}
