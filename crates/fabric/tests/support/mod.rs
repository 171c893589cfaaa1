#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tidewatch_core::settings::WatchKind;
use tidewatch_core::{BackoffPolicy, DeploymentNarrative, Identity};
use tidewatch_fabric::{Fabric, FabricConfig, ProgressPolicy};
use tidewatch_kubehub::fake::FakeCluster;
use tidewatch_persist::MemoryStore;
use tidewatch_store::{Registry, RegistryConfig};

pub const NS: &str = "pe";

pub fn backoff() -> BackoffPolicy {
    BackoffPolicy { base: Duration::from_millis(10), cap: Duration::from_millis(50), max_attempts: None }
}

pub fn config(stabilisation_ms: u64) -> FabricConfig {
    config_for(WatchKind::Deployment, stabilisation_ms)
}

/// Watch only roots of `kind`.
pub fn config_for(kind: WatchKind, stabilisation_ms: u64) -> FabricConfig {
    FabricConfig {
        cluster: "test".into(),
        namespaces: vec![NS.into()],
        kinds: vec![kind],
        progress: ProgressPolicy {
            stabilisation_window: Duration::from_millis(stabilisation_ms),
            max_pod_failures: 3,
            max_warning_events: 5,
            tick: Duration::from_millis(20),
        },
        default_deadline: Duration::from_secs(30),
        replay_window: Duration::from_secs(30),
        subscriber_buffer: 256,
        backoff: backoff(),
    }
}

pub fn id(app: &str, generation: i64) -> Identity {
    Identity::new("test", NS, app, generation)
}

pub struct Harness {
    pub fake: Arc<FakeCluster>,
    pub store: Arc<MemoryStore>,
    pub registry: Registry,
    pub fabric: Fabric,
}

impl Harness {
    pub fn start(config: FabricConfig) -> Self {
        Self::start_with(FakeCluster::new(), config)
    }

    pub fn start_with(fake: FakeCluster, config: FabricConfig) -> Self {
        let fake = Arc::new(fake);
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(
            store.clone(),
            RegistryConfig { linger: Duration::from_secs(60), write_queue: 256, backoff: backoff() },
        );
        let fabric = Fabric::start(fake.clone(), registry.clone(), config);
        Self { fake, store, registry, fabric }
    }

    pub fn narrative(&self, identity: &Identity) -> Option<DeploymentNarrative> {
        self.registry.snapshot(identity)
    }

    /// Poll until `check` holds on the narrative or `timeout` elapses.
    pub async fn wait_for<F>(&self, identity: &Identity, timeout: Duration, check: F) -> DeploymentNarrative
    where
        F: Fn(&DeploymentNarrative) -> bool,
    {
        let start = Instant::now();
        loop {
            if let Some(n) = self.narrative(identity) {
                if check(&n) || start.elapsed() >= timeout {
                    return n;
                }
            } else if start.elapsed() >= timeout {
                panic!("narrative {identity} never opened");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn stop(&self) {
        assert!(self.fabric.shutdown(Duration::from_secs(5)).await);
        self.registry.close().await;
    }
}

/// Poll a plain condition.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
