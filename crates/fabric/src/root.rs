//! Root workload managers: one list+watch per namespace scope for a [`Workload`]
//! kind. Each new generation of a root object opens a narrative, hands the child
//! request down and starts its progress driver.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::ResourceExt;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tidewatch_core::{Backoff, Error, Identity, Status};
use tidewatch_kubehub::{ObjectEvent, ObjectKey, WatchScope};
use tidewatch_store::OpenParams;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{self, EventTarget};
use crate::workload::{Routes, Workload};
use crate::{progress, OwnerRef, Shared, WatchContext, WatchRequest, APPLICATION_ANNOTATION, DEADLINE_ANNOTATION};

pub struct RootManager<W> {
    shared: Arc<Shared>,
    routes: Routes,
    _kind: PhantomData<fn() -> W>,
}

impl<W: Workload> RootManager<W> {
    pub(crate) fn new(shared: Arc<Shared>, routes: Routes) -> Self {
        Self { shared, routes, _kind: PhantomData }
    }

    /// One watch task per configured namespace, or one cluster-wide.
    pub(crate) fn serve(self, token: CancellationToken) {
        for scope in WatchScope::for_namespaces(&self.shared.config.namespaces) {
            let roots = Roots::<W> {
                shared: Arc::clone(&self.shared),
                routes: self.routes.clone(),
                token: token.clone(),
                latest: FxHashMap::default(),
                objects: FxHashMap::default(),
                narratives: FxHashMap::default(),
                recreated: FxHashSet::default(),
                _kind: PhantomData,
            };
            self.shared.tracker.spawn(roots.run(scope));
        }
    }
}

/// Application a root object reports under.
fn application_of<W: Workload>(obj: &W) -> String {
    obj.annotations().get(APPLICATION_ANNOTATION).filter(|a| !a.is_empty()).cloned().unwrap_or_else(|| obj.name_any())
}

fn deadline_of<W: Workload>(obj: &W, default: Duration) -> Duration {
    match obj.annotations().get(DEADLINE_ANNOTATION) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(kind = W::KIND, name = %obj.name_any(), value = %raw, "ignoring invalid progress deadline annotation");
                default
            }
        },
        None => default,
    }
}

/// Per-scope state, owned by the watch task.
struct Roots<W> {
    shared: Arc<Shared>,
    routes: Routes,
    token: CancellationToken,
    /// `(namespace, application) -> newest generation handled or baselined`.
    latest: FxHashMap<(String, String), i64>,
    /// `(namespace, name) -> application`, for deletions seen only as list gaps.
    objects: FxHashMap<(String, String), String>,
    narratives: FxHashMap<Identity, CancellationToken>,
    /// Applications whose root object was deleted; their next generation starts
    /// over even if it matches a sealed one.
    recreated: FxHashSet<(String, String)>,
    _kind: PhantomData<fn() -> W>,
}

impl<W: Workload> Roots<W> {
    async fn run(mut self, scope: WatchScope) {
        let mut backoff = Backoff::new(self.shared.config.backoff);
        info!(kind = W::KIND, ns = ?scope.namespace, "root watch started");
        loop {
            let mut stream = W::watch_roots(self.shared.api.as_ref(), &scope);
            loop {
                let item = tokio::select! {
                    _ = self.token.cancelled() => {
                        info!(kind = W::KIND, ns = ?scope.namespace, "root watch stopped");
                        return;
                    }
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(ObjectEvent::Restarted(list))) => {
                        backoff.reset();
                        self.relist(list).await;
                    }
                    Some(Ok(ObjectEvent::Applied(obj))) => self.applied(&obj).await,
                    Some(Ok(ObjectEvent::Deleted(obj))) => {
                        let ns = obj.namespace().unwrap_or_default();
                        self.deleted(&ns, &obj.name_any()).await;
                    }
                    Some(Err(e @ Error::PermanentApi { .. })) => {
                        error!(kind = W::KIND, ns = ?scope.namespace, error = %e, "root watch refused; giving up");
                        self.shared.raise_fatal(e);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(kind = W::KIND, ns = ?scope.namespace, error = %e, "root watch failed; reconnecting");
                        break;
                    }
                    None => {
                        debug!(kind = W::KIND, ns = ?scope.namespace, "root watch ended; reconnecting");
                        break;
                    }
                }
                self.narratives.retain(|_, t| !t.is_cancelled());
            }
            counter!("watch_reconnects_total", 1u64, "kind" => W::KIND);
            if backoff.wait(&self.token).await.is_err() {
                info!(kind = W::KIND, ns = ?scope.namespace, "root watch stopped");
                return;
            }
        }
    }

    /// A full list. Settled objects nobody has seen yet are baseline, not rollouts.
    async fn relist(&mut self, list: Vec<W>) {
        let gone: Vec<(String, String)> = self
            .objects
            .keys()
            .filter(|(ns, name)| !list.iter().any(|o| o.namespace().unwrap_or_default() == *ns && o.name_any() == *name))
            .cloned()
            .collect();
        for (ns, name) in gone {
            self.deleted(&ns, &name).await;
        }
        for obj in list.iter() {
            let ns = obj.namespace().unwrap_or_default();
            let app = application_of(obj);
            let key = (ns.clone(), app.clone());
            if obj.is_settled() && !self.latest.contains_key(&key) {
                if let Some(generation) = obj.generation() {
                    debug!(kind = W::KIND, %ns, %app, generation, "settled at startup; recorded as baseline");
                    self.objects.insert((ns, obj.name_any()), app);
                    self.recreated.remove(&key);
                    self.latest.insert(key, generation);
                    continue;
                }
            }
            self.applied(obj).await;
        }
    }

    async fn applied(&mut self, obj: &W) {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let app = application_of(obj);
        let Some(generation) = obj.generation() else {
            debug!(kind = W::KIND, %ns, %name, "root object without generation; skipped");
            return;
        };
        self.objects.insert((ns.clone(), name.clone()), app.clone());
        let key = (ns.clone(), app.clone());
        if let Some(&seen) = self.latest.get(&key) {
            if generation == seen {
                let identity = Identity::new(self.shared.config.cluster.clone(), ns, app, generation);
                self.refresh_target(&identity, obj).await;
                return;
            }
            if generation < seen {
                debug!(kind = W::KIND, %ns, %app, generation, newest = seen, "stale generation ignored");
                return;
            }
        }
        let replace_sealed = self.recreated.remove(&key);
        self.latest.insert(key, generation);

        let identity = Identity::new(self.shared.config.cluster.clone(), ns.clone(), app.clone(), generation);
        self.cancel_in_flight(&identity, "superseded", Some(generation)).await;

        let deadline = deadline_of(obj, self.shared.config.default_deadline);
        let target = obj.rollout_target();
        let desired = target.desired.unwrap_or(0);
        let params = OpenParams { kind: W::KIND.to_string(), target, deadline, replace_sealed };
        let (slot, created) = self.shared.registry.open(identity.clone(), params).await;
        if !created {
            return;
        }
        let ctx = WatchContext::new(self.token.child_token(), Some(slot.current().deadline));
        self.narratives.insert(identity.clone(), ctx.token.clone());

        events::follow(
            &self.shared,
            ObjectKey::new(ns.clone(), W::KIND, name.clone()),
            EventTarget::Root { application: app.clone() },
            slot.clone(),
            ctx.token.child_token(),
        );
        let req = WatchRequest {
            desired_replicas: desired,
            selector: obj.selector(),
            namespace: ns,
            application: app,
            slot: slot.clone(),
            ctx: ctx.child(),
            owner: Some(OwnerRef { kind: W::KIND.to_string(), name, uid: obj.uid() }),
        };
        if self.routes.sender(W::child_route()).send(req).await.is_err() {
            debug!(%identity, "child manager gone; narrative will only see root events");
        }
        let policy = self.shared.config.progress.clone();
        self.shared.tracker.spawn(progress::drive(Arc::clone(&self.shared), slot, ctx, policy));
    }

    /// The controller reports its counts after the generation change, so a later
    /// update of the same generation may carry the first trustworthy target.
    async fn refresh_target(&self, identity: &Identity, obj: &W) {
        let target = obj.rollout_target();
        if target.desired.is_none() {
            return;
        }
        let Some(slot) = self.shared.registry.get(identity) else { return };
        if slot.is_sealed() || slot.current().target == target {
            return;
        }
        if self.shared.registry.apply(&slot, |n| n.refresh_target(target)).await == Some(true) {
            debug!(%identity, desired = ?slot.current().target.desired, "rollout target refreshed");
        }
    }

    async fn deleted(&mut self, ns: &str, name: &str) {
        let Some(app) = self.objects.remove(&(ns.to_string(), name.to_string())) else { return };
        info!(kind = W::KIND, %ns, %name, "root object deleted");
        let identity = Identity::new(self.shared.config.cluster.clone(), ns, app.clone(), 0);
        self.cancel_in_flight(&identity, "deleted", None).await;
        // A re-created object starts its generations over.
        let key = (ns.to_string(), app);
        self.latest.remove(&key);
        self.recreated.insert(key);
    }

    /// Seal and cancel unsealed narratives of the same application, limited to
    /// generations older than `older_than` when given.
    async fn cancel_in_flight(&mut self, identity: &Identity, reason: &str, older_than: Option<i64>) {
        for slot in self.shared.registry.in_flight_for(identity) {
            let generation = slot.identity().generation;
            if older_than.is_some_and(|g| generation >= g) {
                continue;
            }
            if self.shared.registry.seal(&slot, Status::Cancelled, Some(reason.to_string())).await {
                info!(identity = %slot.identity(), %reason, "narrative cancelled");
            }
            if let Some(token) = self.narratives.remove(slot.identity()) {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use tidewatch_kubehub::fake::build;

    #[test]
    fn application_defaults_to_the_object_name() {
        let mut d = build::deployment("pe", "web", 1, 1, &[("app", "web")]);
        assert_eq!(application_of::<Deployment>(&d), "web");
        build::annotate(&mut d.metadata, APPLICATION_ANNOTATION, "storefront");
        assert_eq!(application_of::<Deployment>(&d), "storefront");
    }

    #[test]
    fn deadline_annotation_overrides_the_default() {
        let default = Duration::from_secs(1800);
        let mut d = build::deployment("pe", "web", 1, 1, &[("app", "web")]);
        assert_eq!(deadline_of::<Deployment>(&d, default), default);
        build::annotate(&mut d.metadata, DEADLINE_ANNOTATION, "120");
        assert_eq!(deadline_of::<Deployment>(&d, default), Duration::from_secs(120));
        build::annotate(&mut d.metadata, DEADLINE_ANNOTATION, "soon");
        assert_eq!(deadline_of::<Deployment>(&d, default), default);
    }
}
