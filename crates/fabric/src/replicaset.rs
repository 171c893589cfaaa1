//! ReplicaSet manager: watches the ReplicaSets a Deployment controls and asks the
//! pods manager to follow each one's pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::ResourceExt;
use metrics::counter;
use tidewatch_core::{Backoff, Error, LabelSelector, ReplicasetChange};
use tidewatch_kubehub::{convert, ObjectEvent, ObjectKey, WatchScope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{self, EventTarget};
use crate::{OwnerRef, Shared, WatchContext, WatchRequest};

pub struct ReplicaSetManager {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<WatchRequest>,
    pods: mpsc::Sender<WatchRequest>,
}

impl ReplicaSetManager {
    pub(crate) fn new(shared: Arc<Shared>, rx: mpsc::Receiver<WatchRequest>, pods: mpsc::Sender<WatchRequest>) -> Self {
        Self { shared, rx, pods }
    }

    pub(crate) fn serve(self, token: CancellationToken) {
        let Self { shared, mut rx, pods } = self;
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
                    debug!(identity = %req.slot.identity(), error = %e, "replicaset watch request dropped");
                    continue;
                }
                shared.tracker.spawn(watch_replicasets(Arc::clone(&shared), req, pods.clone()));
            }
            debug!("replicaset manager stopped");
        });
    }
}

/// An RS with no owner references is taken on label match alone; one owned by
/// something other than the parent is not ours.
fn owned_by_parent(rs: &ReplicaSet, parent: Option<&OwnerRef>) -> bool {
    let refs = rs.metadata.owner_references.as_deref().unwrap_or_default();
    let Some(parent) = parent else { return true };
    if refs.is_empty() {
        return true;
    }
    refs.iter().any(|r| {
        r.kind == parent.kind
            && r.name == parent.name
            && match parent.uid.as_deref() {
                Some(uid) if !r.uid.is_empty() => r.uid == uid,
                _ => true,
            }
    })
}

struct Child {
    selector: LabelSelector,
    pods: CancellationToken,
}

async fn watch_replicasets(shared: Arc<Shared>, req: WatchRequest, pods_tx: mpsc::Sender<WatchRequest>) {
    let scope = WatchScope::namespaced(&req.namespace).with_labels(req.selector.to_query());
    let identity = req.slot.identity().clone();
    let mut backoff = Backoff::new(shared.config.backoff);
    let mut children: BTreeMap<String, Child> = BTreeMap::new();
    debug!(%identity, selector = %req.selector.to_query(), "replicaset watch started");

    'outer: loop {
        let mut stream = shared.api.replicasets(&scope);
        loop {
            let item = tokio::select! {
                _ = req.ctx.token.cancelled() => break 'outer,
                item = stream.next() => item,
            };
            let keep_going = match item {
                Some(Ok(ObjectEvent::Restarted(list))) => {
                    backoff.reset();
                    let listed: Vec<&ReplicaSet> = list
                        .iter()
                        .filter(|rs| req.selector.matches(rs.labels()) && owned_by_parent(rs, req.owner.as_ref()))
                        .collect();
                    let gone: Vec<String> =
                        children.keys().filter(|name| !listed.iter().any(|rs| rs.name_any() == **name)).cloned().collect();
                    let mut ok = true;
                    for name in gone {
                        ok &= on_deleted(&shared, &req, &name).await;
                    }
                    for rs in listed {
                        ok &= on_applied(&shared, &req, &pods_tx, &mut children, rs).await;
                    }
                    ok
                }
                Some(Ok(ObjectEvent::Applied(rs))) if req.selector.matches(rs.labels()) && owned_by_parent(&rs, req.owner.as_ref()) => {
                    on_applied(&shared, &req, &pods_tx, &mut children, &rs).await
                }
                Some(Ok(ObjectEvent::Applied(rs))) => {
                    debug!(%identity, replicaset = %rs.name_any(), "replicaset not controlled by parent; ignored");
                    true
                }
                Some(Ok(ObjectEvent::Deleted(rs))) if children.contains_key(&rs.name_any()) => {
                    on_deleted(&shared, &req, &rs.name_any()).await
                }
                Some(Ok(ObjectEvent::Deleted(_))) => true,
                Some(Err(e @ Error::PermanentApi { .. })) => {
                    error!(%identity, error = %e, "replicaset watch refused");
                    let msg = e.to_string();
                    shared.registry.apply(&req.slot, |n| n.flag_fatal("watch-permission", msg, Utc::now())).await;
                    break 'outer;
                }
                Some(Err(e)) => {
                    warn!(%identity, error = %e, "replicaset watch failed; reconnecting");
                    break;
                }
                None => break,
            };
            if !keep_going {
                debug!(%identity, "narrative sealed; replicaset watch exiting");
                break 'outer;
            }
        }
        counter!("watch_reconnects_total", 1u64, "kind" => "ReplicaSet");
        if backoff.wait(&req.ctx.token).await.is_err() {
            break;
        }
    }
    for (_, child) in children {
        child.pods.cancel();
    }
    info!(%identity, "replicaset watch stopped");
}

/// Returns `false` once the narrative is sealed.
async fn on_applied(
    shared: &Arc<Shared>,
    req: &WatchRequest,
    pods_tx: &mpsc::Sender<WatchRequest>,
    children: &mut BTreeMap<String, Child>,
    rs: &ReplicaSet,
) -> bool {
    let Some(obs) = convert::replicaset_observation(rs, Utc::now()) else { return true };
    let name = obs.name.clone();
    let selector = obs.selector.clone();
    let desired = obs.desired;
    let app = req.application.clone();
    let now = Utc::now();
    let applied = shared
        .registry
        .apply(&req.slot, |n| {
            n.note_child_observation();
            n.application_mut(&app).upsert_replicaset(obs, now)
        })
        .await;
    let Some(change) = applied else { return false };

    let first_sight = !children.contains_key(&name);
    if change == ReplicasetChange::SelectorChanged {
        info!(identity = %req.slot.identity(), replicaset = %name, "replicaset selector changed; record retired");
    }
    let needs_pods = match children.get(&name) {
        Some(child) => child.selector != selector,
        None => true,
    };
    if !needs_pods {
        return true;
    }
    if let Some(old) = children.remove(&name) {
        old.pods.cancel();
    }
    if first_sight {
        debug!(identity = %req.slot.identity(), replicaset = %name, "replicaset observed");
        events::follow(
            shared,
            ObjectKey::new(req.namespace.clone(), "ReplicaSet", name.clone()),
            EventTarget::ReplicaSet { application: req.application.clone(), name: name.clone() },
            req.slot.clone(),
            req.ctx.token.child_token(),
        );
    }
    let ctx = WatchContext::new(req.ctx.token.child_token(), req.ctx.deadline);
    let pods = ctx.token.clone();
    let child_req = WatchRequest {
        desired_replicas: desired,
        selector: selector.clone(),
        namespace: req.namespace.clone(),
        application: req.application.clone(),
        slot: req.slot.clone(),
        ctx,
        owner: Some(OwnerRef { kind: "ReplicaSet".into(), name: name.clone(), uid: rs.uid() }),
    };
    if pods_tx.send(child_req).await.is_err() {
        debug!(replicaset = %name, "pods manager gone; not following pods");
    }
    children.insert(name, Child { selector, pods });
    true
}

async fn on_deleted(shared: &Arc<Shared>, req: &WatchRequest, name: &str) -> bool {
    let app = req.application.clone();
    let now = Utc::now();
    let applied = shared.registry.apply(&req.slot, |n| n.application_mut(&app).end_replicaset(name, now)).await;
    if applied == Some(true) {
        debug!(identity = %req.slot.identity(), replicaset = %name, "replicaset ended");
    }
    applied.is_some()
}
