//! Projection of k8s-openapi objects into the narrative model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as K8sSelector, ObjectMeta, OwnerReference};
use tidewatch_core::selector::{Operator, Requirement};
use tidewatch_core::{EventRecord, EventType, LabelSelector, PodObservation, PodPhase, ReplicasetObservation};

/// `(namespace, kind, name)` of an involved object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into(), name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

pub fn selector_from_k8s(sel: &K8sSelector) -> LabelSelector {
    let match_labels = sel.match_labels.clone().unwrap_or_default();
    let match_expressions = sel
        .match_expressions
        .iter()
        .flatten()
        .filter_map(|r| {
            let operator = match r.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                _ => return None,
            };
            Some(Requirement { key: r.key.clone(), operator, values: r.values.clone().unwrap_or_default() })
        })
        .collect();
    LabelSelector { match_labels, match_expressions }
}

pub fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

pub fn created_at(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.creation_timestamp.as_ref().map(|t| t.0)
}

/// The controller owner reference of the given kind, else the first of that kind.
pub fn owner_of_kind<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a OwnerReference> {
    let refs = meta.owner_references.as_ref()?;
    refs.iter()
        .find(|o| o.kind == kind && o.controller.unwrap_or(false))
        .or_else(|| refs.iter().find(|o| o.kind == kind))
}

pub fn pod_observation(pod: &Pod) -> Option<PodObservation> {
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).map(PodPhase::from).unwrap_or(PodPhase::Unknown);
    let conditions = status.and_then(|s| s.conditions.as_ref());
    let ready = match conditions {
        Some(conds) if !conds.is_empty() => conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"),
        _ => phase == PodPhase::Running,
    };
    let crash_looping = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| {
            cs.iter().any(|c| {
                c.state
                    .as_ref()
                    .and_then(|st| st.waiting.as_ref())
                    .and_then(|w| w.reason.as_deref())
                    == Some("CrashLoopBackOff")
            })
        })
        .unwrap_or(false);
    Some(PodObservation {
        name,
        labels: labels_of(&pod.metadata),
        phase,
        ready,
        crash_looping,
        created_at: created_at(&pod.metadata),
        owner_replicaset: owner_of_kind(&pod.metadata, "ReplicaSet").map(|o| o.name.clone()),
    })
}

pub fn replicaset_observation(rs: &ReplicaSet, now: DateTime<Utc>) -> Option<ReplicasetObservation> {
    let name = rs.metadata.name.clone()?;
    let spec = rs.spec.as_ref();
    let status = rs.status.as_ref();
    Some(ReplicasetObservation {
        name,
        created_at: created_at(&rs.metadata).unwrap_or(now),
        desired: spec.and_then(|s| s.replicas).unwrap_or(1),
        current: status.map(|s| s.replicas).unwrap_or(0),
        ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        selector: spec.map(|s| selector_from_k8s(&s.selector)).unwrap_or_default(),
    })
}

/// Involved object plus the projected record. Events without an involved kind or
/// name cannot be routed and yield `None`.
pub fn event_record(ev: &Event, now: DateTime<Utc>) -> Option<(ObjectKey, EventRecord)> {
    let involved = &ev.involved_object;
    let kind = involved.kind.clone()?;
    let name = involved.name.clone()?;
    let namespace = involved
        .namespace
        .clone()
        .or_else(|| ev.metadata.namespace.clone())
        .unwrap_or_default();
    let first_seen = ev
        .first_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| ev.event_time.as_ref().map(|t| t.0))
        .or_else(|| created_at(&ev.metadata))
        .unwrap_or(now);
    let last_seen = ev.last_timestamp.as_ref().map(|t| t.0).unwrap_or(first_seen).max(first_seen);
    let source = ev
        .source
        .as_ref()
        .and_then(|s| s.component.clone())
        .or_else(|| ev.reporting_component.clone())
        .unwrap_or_default();
    let record = EventRecord {
        name: ev.metadata.name.clone().unwrap_or_default(),
        message: ev.message.clone().unwrap_or_default(),
        reason: ev.reason.clone().unwrap_or_default(),
        kind: ev.type_.as_deref().map(EventType::from).unwrap_or(EventType::Normal),
        source,
        first_seen,
        last_seen,
        count: ev.count.unwrap_or(1).max(1) as u32,
    };
    Some((ObjectKey::new(namespace, kind, name), record))
}
