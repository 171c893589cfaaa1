//! Tidewatch kubehub: the API gateway every manager shares.
//!
//! One trait, [`ClusterApi`], exposes list+watch streams for the kinds the fabric
//! follows. [`KubeGateway`] backs it with kube-rs; [`fake::FakeCluster`] backs it
//! with an in-memory object store for tests.

#![forbid(unsafe_code)]

pub mod convert;
pub mod fake;
mod gateway;

use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Event, Pod};
use tidewatch_core::Error;

pub use convert::ObjectKey;
pub use gateway::KubeGateway;

/// One item of a list+watch stream. `Restarted` carries a full (re-)list.
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    Applied(K),
    Deleted(K),
    Restarted(Vec<K>),
}

pub type WatchStream<K> = BoxStream<'static, Result<ObjectEvent<K>, Error>>;

/// Namespace and label query a stream is restricted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchScope {
    pub namespace: Option<String>,
    pub labels: Option<String>,
}

impl WatchScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), labels: None }
    }

    pub fn with_labels(mut self, query: impl Into<String>) -> Self {
        self.labels = Some(query.into());
        self
    }

    /// One scope per configured namespace, or a single cluster-wide scope.
    pub fn for_namespaces(namespaces: &[String]) -> Vec<Self> {
        if namespaces.is_empty() {
            vec![Self::all()]
        } else {
            namespaces.iter().map(Self::namespaced).collect()
        }
    }
}

/// List+watch access to the cluster. Every call opens a fresh stream that starts
/// with a `Restarted` list, so reconnecting is how callers re-list.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    fn deployments(&self, scope: &WatchScope) -> WatchStream<Deployment>;
    fn daemonsets(&self, scope: &WatchScope) -> WatchStream<DaemonSet>;
    fn statefulsets(&self, scope: &WatchScope) -> WatchStream<StatefulSet>;
    fn replicasets(&self, scope: &WatchScope) -> WatchStream<ReplicaSet>;
    fn pods(&self, scope: &WatchScope) -> WatchStream<Pod>;
    fn events(&self, scope: &WatchScope) -> WatchStream<Event>;

    /// Cheap reachability check used at startup.
    async fn probe(&self) -> Result<(), Error>;
}
