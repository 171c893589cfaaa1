//! Tidewatch watch fabric.
//!
//! A cascade of watchers over one shared [`ClusterApi`]: root workload managers open
//! a narrative per rollout and hand a [`WatchRequest`] to the ReplicaSet or Pods
//! manager, which fan out further for every child they observe. Events are attached
//! at each level through the [`EventsManager`]. One progress driver per narrative
//! decides when it ends; sealing cancels the narrative's token and with it every
//! task underneath.

#![forbid(unsafe_code)]

pub mod events;
pub mod pods;
pub mod progress;
pub mod replicaset;
pub mod root;
pub mod workload;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use tidewatch_core::settings::WatchKind;
use tidewatch_core::{BackoffPolicy, Error, LabelSelector, Settings};
use tidewatch_kubehub::{ClusterApi, WatchScope};
use tidewatch_store::{Registry, Slot};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub use events::{Delivery, EventsManager, Subscription};
pub use progress::{evaluate, ProgressPolicy, Stability};
pub use root::RootManager;
pub use workload::{DaemonSets, Deployments, Route, StatefulSets, Workload};

/// Annotation overriding the application name of a root object.
pub const APPLICATION_ANNOTATION: &str = "tidewatch.io/application";
/// Annotation overriding the progress deadline, in seconds.
pub const DEADLINE_ANNOTATION: &str = "tidewatch.io/progress-deadline-seconds";

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub cluster: String,
    pub namespaces: Vec<String>,
    pub kinds: Vec<WatchKind>,
    pub progress: ProgressPolicy,
    pub default_deadline: Duration,
    pub replay_window: Duration,
    pub subscriber_buffer: usize,
    pub backoff: BackoffPolicy,
}

impl FabricConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            cluster: s.cluster_name.clone(),
            namespaces: s.watch.namespaces.clone(),
            kinds: s.watch.kinds.clone(),
            progress: ProgressPolicy {
                stabilisation_window: s.progress.stabilisation_window,
                max_pod_failures: s.progress.max_pod_failures,
                max_warning_events: s.progress.max_warning_events,
                ..ProgressPolicy::default()
            },
            default_deadline: s.progress.default_deadline,
            replay_window: s.events.replay_window,
            subscriber_buffer: s.events.subscriber_buffer,
            backoff: s.backoff.policy(),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Cancellation plus the narrative deadline, carried by every request.
#[derive(Debug, Clone)]
pub struct WatchContext {
    pub token: CancellationToken,
    pub deadline: Option<DateTime<Utc>>,
}

impl WatchContext {
    pub fn new(token: CancellationToken, deadline: Option<DateTime<Utc>>) -> Self {
        Self { token, deadline }
    }

    /// Context for a subtree: cancelled with this one, or on its own.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }
}

/// Object a child must be controlled by to be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub uid: Option<String>,
}

/// The message every manager consumes on its inbound channel.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub desired_replicas: i32,
    pub selector: LabelSelector,
    pub namespace: String,
    /// Key into the narrative's `resources` the watcher writes under.
    pub application: String,
    pub slot: Slot,
    pub ctx: WatchContext,
    pub owner: Option<OwnerRef>,
}

/// State every manager shares. Injected, never global.
pub(crate) struct Shared {
    pub(crate) api: Arc<dyn ClusterApi>,
    pub(crate) registry: Registry,
    pub(crate) events: EventsManager,
    pub(crate) tracker: TaskTracker,
    pub(crate) config: FabricConfig,
    pub(crate) fatal: watch::Sender<Option<Error>>,
}

impl Shared {
    /// Report an unrecoverable condition to the process. First report wins.
    pub(crate) fn raise_fatal(&self, err: Error) {
        self.fatal.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                false
            }
        });
    }
}

/// Running fabric. Dropping it does not stop anything; call [`Fabric::shutdown`].
pub struct Fabric {
    shared: Arc<Shared>,
    root: CancellationToken,
    fatal_rx: watch::Receiver<Option<Error>>,
}

impl Fabric {
    /// Wire the managers together and start serving.
    pub fn start(api: Arc<dyn ClusterApi>, registry: Registry, config: FabricConfig) -> Self {
        let (fatal, fatal_rx) = watch::channel(None);
        let events = EventsManager::new(config.replay_window, config.subscriber_buffer);
        let shared = Arc::new(Shared { api, registry, events, tracker: TaskTracker::new(), config, fatal });
        let root = CancellationToken::new();

        let (pods_tx, pods_rx) = mpsc::channel::<WatchRequest>(INBOUND_CAPACITY);
        let (rs_tx, rs_rx) = mpsc::channel::<WatchRequest>(INBOUND_CAPACITY);
        let scopes = WatchScope::for_namespaces(&shared.config.namespaces);

        shared.events.serve(&shared, scopes, root.clone());
        pods::PodsManager::new(Arc::clone(&shared), pods_rx).serve(root.clone());
        replicaset::ReplicaSetManager::new(Arc::clone(&shared), rs_rx, pods_tx.clone()).serve(root.clone());

        let routes = workload::Routes { replicasets: rs_tx, pods: pods_tx };
        for kind in shared.config.kinds.clone() {
            match kind {
                WatchKind::Deployment => RootManager::<Deployment>::new(Arc::clone(&shared), routes.clone()).serve(root.clone()),
                WatchKind::Daemonset => RootManager::<DaemonSet>::new(Arc::clone(&shared), routes.clone()).serve(root.clone()),
                WatchKind::Statefulset => RootManager::<StatefulSet>::new(Arc::clone(&shared), routes.clone()).serve(root.clone()),
            }
        }
        info!(cluster = %shared.config.cluster, kinds = ?shared.config.kinds, namespaces = ?shared.config.namespaces, "watch fabric started");
        Self { shared, root, fatal_rx }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn events(&self) -> &EventsManager {
        &self.shared.events
    }

    /// Receiver that turns `Some` when a root watch hits an unrecoverable error.
    pub fn fatal(&self) -> watch::Receiver<Option<Error>> {
        self.fatal_rx.clone()
    }

    /// Tasks currently running under the fabric.
    pub fn task_count(&self) -> usize {
        self.shared.tracker.len()
    }

    /// Cancel everything and wait for every task to exit. Returns `false` when the
    /// window elapsed first. Idempotent.
    pub async fn shutdown(&self, window: Duration) -> bool {
        self.root.cancel();
        self.shared.tracker.close();
        match tokio::time::timeout(window, self.shared.tracker.wait()).await {
            Ok(()) => {
                info!("watch fabric drained");
                true
            }
            Err(_) => {
                warn!(remaining = self.shared.tracker.len(), ?window, "watch fabric did not drain in time");
                false
            }
        }
    }
}
