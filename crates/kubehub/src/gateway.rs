use std::fmt::Debug;
use std::path::Path;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::watcher::{self, Event as WatchEvent},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tidewatch_core::Error;
use tracing::{debug, info};

use crate::{ClusterApi, ObjectEvent, WatchScope, WatchStream};

/// kube-rs backed gateway. The client is cheap to clone and safe to share.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// In-cluster config or `~/.kube/config`.
    pub async fn try_default() -> Result<Self, Error> {
        let client = Client::try_default().await.map_err(|e| Error::Config(format!("kube client: {e}")))?;
        Ok(Self::new(client))
    }

    pub async fn from_kubeconfig(path: &Path) -> Result<Self, Error> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| Error::Config(format!("reading kubeconfig {}: {e}", path.display())))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Config(format!("kubeconfig {}: {e}", path.display())))?;
        let client = Client::try_from(config).map_err(|e| Error::Config(format!("kube client: {e}")))?;
        Ok(Self::new(client))
    }

    fn stream<K>(&self, scope: &WatchScope) -> WatchStream<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
    {
        let api: Api<K> = match scope.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut cfg = watcher::Config::default();
        if let Some(labels) = scope.labels.as_deref() {
            cfg = cfg.labels(labels);
        }
        debug!(kind = %K::kind(&()), ns = ?scope.namespace, labels = ?scope.labels, "opening watch");
        watcher::watcher(api, cfg)
            .map(|res| match res {
                Ok(WatchEvent::Applied(o)) => Ok(ObjectEvent::Applied(o)),
                Ok(WatchEvent::Deleted(o)) => Ok(ObjectEvent::Deleted(o)),
                Ok(WatchEvent::Restarted(list)) => Ok(ObjectEvent::Restarted(list)),
                Err(e) => Err(classify_watcher(e)),
            })
            .boxed()
    }
}

pub(crate) fn classify_kube(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) => Error::from_status(resp.code, resp.message),
        other => Error::TransientApi(other.to_string()),
    }
}

pub(crate) fn classify_watcher(e: watcher::Error) -> Error {
    match e {
        watcher::Error::InitialListFailed(e) | watcher::Error::WatchStartFailed(e) | watcher::Error::WatchFailed(e) => classify_kube(e),
        watcher::Error::WatchError(resp) => Error::from_status(resp.code, resp.message),
        #[allow(unreachable_patterns)]
        other => Error::TransientApi(other.to_string()),
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeGateway {
    fn deployments(&self, scope: &WatchScope) -> WatchStream<Deployment> {
        self.stream(scope)
    }

    fn daemonsets(&self, scope: &WatchScope) -> WatchStream<DaemonSet> {
        self.stream(scope)
    }

    fn statefulsets(&self, scope: &WatchScope) -> WatchStream<StatefulSet> {
        self.stream(scope)
    }

    fn replicasets(&self, scope: &WatchScope) -> WatchStream<ReplicaSet> {
        self.stream(scope)
    }

    fn pods(&self, scope: &WatchScope) -> WatchStream<Pod> {
        self.stream(scope)
    }

    fn events(&self, scope: &WatchScope) -> WatchStream<Event> {
        self.stream(scope)
    }

    async fn probe(&self) -> Result<(), Error> {
        let info = self.client.apiserver_version().await.map_err(classify_kube)?;
        info!(version = %info.git_version, "apiserver reachable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "nope".into(), reason: "Forbidden".into(), code })
    }

    #[test]
    fn forbidden_is_permanent() {
        let e = classify_watcher(watcher::Error::InitialListFailed(api_err(403)));
        assert_eq!(e, Error::PermanentApi { code: 403, message: "nope".into() });
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(classify_watcher(watcher::Error::WatchFailed(api_err(429))).is_transient());
        assert!(classify_kube(api_err(500)).is_transient());
        let gone = ErrorResponse { status: "Failure".into(), message: "too old".into(), reason: "Gone".into(), code: 410 };
        assert!(classify_watcher(watcher::Error::WatchError(gone)).is_transient());
    }
}
