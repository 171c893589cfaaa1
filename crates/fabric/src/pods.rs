//! Pods manager: one watch task per request, writing pod lifecycles into the slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use metrics::counter;
use tidewatch_core::{Backoff, Error};
use tidewatch_kubehub::{convert, ObjectEvent, ObjectKey, WatchScope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{self, EventTarget};
use crate::{Shared, WatchRequest};

pub struct PodsManager {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<WatchRequest>,
}

impl PodsManager {
    pub(crate) fn new(shared: Arc<Shared>, rx: mpsc::Receiver<WatchRequest>) -> Self {
        Self { shared, rx }
    }

    pub(crate) fn serve(self, token: CancellationToken) {
        let Self { shared, mut rx } = self;
        let tracker = shared.tracker.clone();
        tracker.spawn(async move {
            loop {
                let req = tokio::select! {
                    _ = token.cancelled() => break,
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => break,
                    },
                };
                if let Err(e) = req.selector.validate() {
                    debug!(identity = %req.slot.identity(), error = %e, "pod watch request dropped");
                    continue;
                }
                let shared_task = Arc::clone(&shared);
                shared.tracker.spawn(watch_pods(shared_task, req));
            }
            debug!("pods manager stopped");
        });
    }
}

/// Per-pod state held on the watch task's stack.
struct Followed {
    token: CancellationToken,
}

async fn watch_pods(shared: Arc<Shared>, req: WatchRequest) {
    let scope = WatchScope::namespaced(&req.namespace).with_labels(req.selector.to_query());
    let identity = req.slot.identity().clone();
    let mut backoff = Backoff::new(shared.config.backoff);
    let mut followed: BTreeMap<String, Followed> = BTreeMap::new();
    debug!(%identity, selector = %req.selector.to_query(), "pod watch started");

    'outer: loop {
        let mut stream = shared.api.pods(&scope);
        loop {
            let item = tokio::select! {
                _ = req.ctx.token.cancelled() => break 'outer,
                item = stream.next() => item,
            };
            let keep_going = match item {
                Some(Ok(ObjectEvent::Restarted(list))) => {
                    backoff.reset();
                    let listed: Vec<&Pod> = list.iter().filter(|p| req.selector.matches(p.labels())).collect();
                    let gone: Vec<String> =
                        followed.keys().filter(|name| !listed.iter().any(|p| p.name_any() == **name)).cloned().collect();
                    let mut ok = true;
                    for name in gone {
                        ok &= on_deleted(&shared, &req, &mut followed, &name).await;
                    }
                    for pod in listed {
                        ok &= on_applied(&shared, &req, &mut followed, pod).await;
                    }
                    ok
                }
                Some(Ok(ObjectEvent::Applied(pod))) if req.selector.matches(pod.labels()) => {
                    on_applied(&shared, &req, &mut followed, &pod).await
                }
                Some(Ok(ObjectEvent::Applied(_))) => true,
                Some(Ok(ObjectEvent::Deleted(pod))) if followed.contains_key(&pod.name_any()) => {
                    on_deleted(&shared, &req, &mut followed, &pod.name_any()).await
                }
                Some(Ok(ObjectEvent::Deleted(_))) => true,
                Some(Err(e @ Error::PermanentApi { .. })) => {
                    error!(%identity, error = %e, "pod watch refused");
                    let msg = e.to_string();
                    shared.registry.apply(&req.slot, |n| n.flag_fatal("watch-permission", msg, Utc::now())).await;
                    break 'outer;
                }
                Some(Err(e)) => {
                    warn!(%identity, error = %e, "pod watch failed; reconnecting");
                    break;
                }
                None => break,
            };
            if !keep_going {
                debug!(%identity, "narrative sealed; pod watch exiting");
                break 'outer;
            }
        }
        counter!("watch_reconnects_total", 1u64, "kind" => "Pod");
        if backoff.wait(&req.ctx.token).await.is_err() {
            break;
        }
    }
    for (_, f) in followed {
        f.token.cancel();
    }
    info!(%identity, "pod watch stopped");
}

/// Returns `false` once the narrative is sealed.
async fn on_applied(shared: &Arc<Shared>, req: &WatchRequest, followed: &mut BTreeMap<String, Followed>, pod: &Pod) -> bool {
    let Some(obs) = convert::pod_observation(pod) else { return true };
    let name = obs.name.clone();
    let app = req.application.clone();
    let now = Utc::now();
    let applied = shared
        .registry
        .apply(&req.slot, |n| {
            n.note_child_observation();
            n.application_mut(&app).observe_pod(obs, now)
        })
        .await;
    let Some(is_new) = applied else { return false };
    if is_new {
        debug!(identity = %req.slot.identity(), pod = %name, "pod observed");
    }
    if !followed.contains_key(&name) {
        let token = req.ctx.token.child_token();
        events::follow(
            shared,
            ObjectKey::new(req.namespace.clone(), "Pod", name.clone()),
            EventTarget::Pod { application: req.application.clone(), name: name.clone() },
            req.slot.clone(),
            token.clone(),
        );
        followed.insert(name, Followed { token });
    }
    true
}

async fn on_deleted(shared: &Arc<Shared>, req: &WatchRequest, followed: &mut BTreeMap<String, Followed>, name: &str) -> bool {
    if let Some(f) = followed.remove(name) {
        f.token.cancel();
    }
    let app = req.application.clone();
    let now = Utc::now();
    shared.registry.apply(&req.slot, |n| n.application_mut(&app).mark_pod_deleted(name, now)).await.is_some()
}
