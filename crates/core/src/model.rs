//! Deployment narrative data model.
//!
//! Ownership runs parent -> child only. Pods refer to their ReplicaSet by name and
//! the narrative resolves the name; there are no back pointers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

/// Narrative identity: one rollout of one application generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub cluster: String,
    pub namespace: String,
    pub application: String,
    pub generation: i64,
}

impl Identity {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>, application: impl Into<String>, generation: i64) -> Self {
        Self { cluster: cluster.into(), namespace: namespace.into(), application: application.into(), generation }
    }

    /// Same application regardless of generation.
    pub fn same_application(&self, other: &Identity) -> bool {
        self.cluster == other.cluster && self.namespace == other.namespace && self.application == other.application
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}@{}", self.cluster, self.namespace, self.application, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::TimedOut | Status::Cancelled)
    }

    /// Pending -> Running -> terminal. Pending may also end directly
    /// (a rollout can time out or be cancelled before any child shows up).
    pub fn can_transition_to(self, next: Status) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Status::Pending, Status::Running) => true,
            (Status::Pending | Status::Running, to) => to.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::TimedOut => "timed_out",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Status::Pending,
            "running" => Status::Running,
            "succeeded" => Status::Succeeded,
            "failed" => Status::Failed,
            "timed_out" => Status::TimedOut,
            "cancelled" => Status::Cancelled,
            other => return Err(crate::Error::Config(format!("unknown status: {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("warning") { EventType::Warning } else { EventType::Normal }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Name of the upstream Event object; with `first_seen` it is the dedupe key.
    pub name: String,
    pub message: String,
    pub reason: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub source: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u32,
}

impl EventRecord {
    /// Warning recorded by the fabric itself (watch failures and similar).
    pub fn synthetic(reason: &str, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: format!("tidewatch.{reason}"),
            message: message.into(),
            reason: reason.to_string(),
            kind: EventType::Warning,
            source: "tidewatch".to_string(),
            first_seen: at,
            last_seen: at,
            count: 1,
        }
    }
}

/// Events ordered by first-seen; duplicates coalesce into one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog(Vec<EventRecord>);

impl EventLog {
    /// Insert or coalesce. Returns true when a new record was added.
    pub fn insert(&mut self, event: EventRecord) -> bool {
        if let Some(existing) = self.0.iter_mut().find(|e| e.name == event.name && e.first_seen == event.first_seen) {
            existing.count = existing.count.saturating_add(1);
            if event.last_seen > existing.last_seen {
                existing.last_seen = event.last_seen;
                existing.message = event.message;
            }
            return false;
        }
        let pos = self.0.partition_point(|e| e.first_seen <= event.first_seen);
        self.0.insert(pos, EventRecord { count: 1, ..event });
        true
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, EventRecord> { self.0.iter() }
    pub fn as_slice(&self) -> &[EventRecord] { &self.0 }

    /// Sum of observation counts for Warning events whose reason is listed.
    pub fn warning_count(&self, reasons: &[&str]) -> u32 {
        self.0
            .iter()
            .filter(|e| e.kind == EventType::Warning && reasons.contains(&e.reason.as_str()))
            .map(|e| e.count)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: PodPhase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub phases: Vec<PhaseTransition>,
    pub events: EventLog,
    pub replicaset: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub crash_looping: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PodRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            phases: Vec::new(),
            events: EventLog::default(),
            replicaset: None,
            ready: false,
            crash_looping: false,
            created_at: None,
            deleted_at: None,
        }
    }

    pub fn current_phase(&self) -> Option<PodPhase> {
        self.phases.last().map(|t| t.phase)
    }

    /// Append a transition iff the phase differs from the last recorded one.
    pub fn record_phase(&mut self, phase: PodPhase, at: DateTime<Utc>) -> bool {
        if self.current_phase() == Some(phase) {
            return false;
        }
        self.phases.push(PhaseTransition { phase, at });
        true
    }

    pub fn failure_count(&self) -> usize {
        self.phases.iter().filter(|t| t.phase == PodPhase::Failed).count()
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn is_unhealthy(&self) -> bool {
        self.crash_looping || self.current_phase() == Some(PodPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasetRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub desired: i32,
    pub current: i32,
    pub ready: i32,
    /// Frozen at creation.
    pub selector: LabelSelector,
    pub events: EventLog,
    pub pods: BTreeSet<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// What the fabric saw of a ReplicaSet on one watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicasetObservation {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub desired: i32,
    pub current: i32,
    pub ready: i32,
    pub selector: LabelSelector,
}

/// What the fabric saw of a Pod on one watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    pub ready: bool,
    pub crash_looping: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// Name of the ReplicaSet in the pod's controller owner reference.
    pub owner_replicaset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicasetChange {
    Created,
    Refreshed,
    SelectorChanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationResources {
    pub replicasets: BTreeMap<String, ReplicasetRecord>,
    pub pods: BTreeMap<String, PodRecord>,
    pub root_events: EventLog,
}

impl ApplicationResources {
    /// Insert or refresh a ReplicaSet record keyed by name. Nested sequences survive
    /// a refresh; a different selector retires the old record under `<name>~<n>`.
    pub fn upsert_replicaset(&mut self, obs: ReplicasetObservation, now: DateTime<Utc>) -> ReplicasetChange {
        let change = match self.replicasets.get_mut(&obs.name) {
            Some(rec) if rec.selector == obs.selector => {
                rec.desired = obs.desired;
                rec.current = obs.current;
                rec.ready = obs.ready;
                rec.ended_at = None;
                return ReplicasetChange::Refreshed;
            }
            Some(_) => ReplicasetChange::SelectorChanged,
            None => ReplicasetChange::Created,
        };
        if change == ReplicasetChange::SelectorChanged {
            if let Some(mut old) = self.replicasets.remove(&obs.name) {
                old.ended_at.get_or_insert(now);
                let prefix = format!("{}~", obs.name);
                let n = self.replicasets.keys().filter(|k| k.starts_with(&prefix)).count() + 1;
                let key = format!("{}{}", prefix, n);
                for name in old.pods.iter() {
                    if let Some(p) = self.pods.get_mut(name) {
                        p.replicaset = Some(key.clone());
                    }
                }
                self.replicasets.insert(key, old);
            }
        }
        self.replicasets.insert(
            obs.name.clone(),
            ReplicasetRecord {
                name: obs.name,
                created_at: obs.created_at,
                desired: obs.desired,
                current: obs.current,
                ready: obs.ready,
                selector: obs.selector,
                events: EventLog::default(),
                pods: BTreeSet::new(),
                ended_at: None,
            },
        );
        change
    }

    pub fn end_replicaset(&mut self, name: &str, at: DateTime<Utc>) -> bool {
        match self.replicasets.get_mut(name) {
            Some(rec) if rec.ended_at.is_none() => {
                rec.ended_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// The live ReplicaSet created most recently: the one carrying the current generation.
    pub fn current_replicaset(&self) -> Option<&ReplicasetRecord> {
        self.replicasets
            .iter()
            .filter(|(key, rs)| rs.ended_at.is_none() && key.as_str() == rs.name)
            .map(|(_, rs)| rs)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)))
    }

    /// Owner reference wins when it names a tracked ReplicaSet; otherwise the most
    /// recently created live ReplicaSet whose selector matches the pod labels.
    fn resolve_owner(&self, owner: Option<&str>, labels: &BTreeMap<String, String>) -> Option<String> {
        if let Some(owner) = owner {
            if self.replicasets.contains_key(owner) {
                return Some(owner.to_string());
            }
        }
        self.replicasets
            .iter()
            .filter(|(key, rs)| rs.ended_at.is_none() && key.as_str() == rs.name && rs.selector.matches(labels))
            .map(|(_, rs)| rs)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)))
            .map(|rs| rs.name.clone())
    }

    /// Attach a pod to exactly one ReplicaSet (or none).
    fn attribute_pod(&mut self, pod: &str, replicaset: Option<String>) {
        for rs in self.replicasets.values_mut() {
            rs.pods.remove(pod);
        }
        if let Some(rs_name) = replicaset.as_deref() {
            if let Some(rs) = self.replicasets.get_mut(rs_name) {
                rs.pods.insert(pod.to_string());
            }
        }
        if let Some(rec) = self.pods.get_mut(pod) {
            rec.replicaset = replicaset;
        }
    }

    /// Record a pod observation. Returns true when the pod was not known before.
    pub fn observe_pod(&mut self, obs: PodObservation, now: DateTime<Utc>) -> bool {
        let is_new = !self.pods.contains_key(&obs.name);
        let previous_owner = self.pods.get(&obs.name).and_then(|p| p.replicaset.clone());
        let resolved = self
            .resolve_owner(obs.owner_replicaset.as_deref(), &obs.labels)
            .or_else(|| previous_owner.filter(|o| self.replicasets.contains_key(o)));
        let rec = self.pods.entry(obs.name.clone()).or_insert_with(|| PodRecord::new(obs.name.clone()));
        rec.labels = obs.labels;
        rec.ready = obs.ready;
        rec.crash_looping = obs.crash_looping;
        if obs.created_at.is_some() {
            rec.created_at = obs.created_at;
        }
        rec.deleted_at = None;
        rec.record_phase(obs.phase, now);
        self.attribute_pod(&obs.name, resolved);
        is_new
    }

    pub fn mark_pod_deleted(&mut self, name: &str, at: DateTime<Utc>) -> bool {
        match self.pods.get_mut(name) {
            Some(rec) if rec.deleted_at.is_none() => {
                rec.deleted_at = Some(at);
                rec.ready = false;
                true
            }
            _ => false,
        }
    }

    pub fn record_pod_event(&mut self, pod: &str, event: EventRecord) -> bool {
        self.pods.entry(pod.to_string()).or_insert_with(|| PodRecord::new(pod)).events.insert(event)
    }

    pub fn record_replicaset_event(&mut self, replicaset: &str, event: EventRecord) -> bool {
        match self.replicasets.get_mut(replicaset) {
            Some(rs) => rs.events.insert(event),
            None => false,
        }
    }

    /// Pods of the current generation: those of the current ReplicaSet. A workload
    /// without ReplicaSets (DaemonSet, StatefulSet) counts every pod, or only those
    /// labelled with `revision` when the controller reported one.
    pub fn current_pods(&self, revision: Option<&str>) -> Vec<&PodRecord> {
        match self.current_replicaset() {
            Some(rs) => self.pods.values().filter(|p| p.replicaset.as_deref() == Some(rs.name.as_str())).collect(),
            None if self.replicasets.is_empty() => match revision {
                Some(rev) => self.pods.values().filter(|p| p.labels.get(REVISION_LABEL).map(String::as_str) == Some(rev)).collect(),
                None => self.pods.values().collect(),
            },
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources {
    pub applications: BTreeMap<String, ApplicationResources>,
}

/// Pod label carrying the controller revision a DaemonSet or StatefulSet pod was
/// created from.
pub const REVISION_LABEL: &str = "controller-revision-hash";

/// What the root controller reports for the generation being rolled out.
/// Refreshed from later observations of the same generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutTarget {
    /// `None` until the controller has observed the generation.
    pub desired: Option<i32>,
    /// Replicas already on the new template, when the controller reports it.
    pub updated: Option<i32>,
    pub update_revision: Option<String>,
}

impl RolloutTarget {
    pub fn desired(desired: i32) -> Self {
        Self { desired: Some(desired), ..Self::default() }
    }

    /// Every desired replica is on the new template.
    pub fn fully_updated(&self) -> bool {
        match (self.desired, self.updated) {
            (Some(desired), Some(updated)) => updated >= desired,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentNarrative {
    pub identity: Identity,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub desired_replicas: i32,
    #[serde(default)]
    pub target: RolloutTarget,
    pub deadline: DateTime<Utc>,
    pub deadline_secs: u64,
    pub status: Status,
    pub status_reason: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set by a watcher that hit an unrecoverable error for this narrative.
    #[serde(default)]
    pub fatal: Option<String>,
    pub resources: Resources,
}

impl DeploymentNarrative {
    pub fn new(identity: Identity, kind: impl Into<String>, desired_replicas: i32, deadline: Duration, now: DateTime<Utc>) -> Self {
        let deadline_at = chrono::Duration::from_std(deadline).ok().and_then(|d| now.checked_add_signed(d)).unwrap_or(now);
        let mut resources = Resources::default();
        resources.applications.insert(identity.application.clone(), ApplicationResources::default());
        Self {
            identity,
            kind: kind.into(),
            created_at: now,
            desired_replicas,
            target: RolloutTarget::desired(desired_replicas),
            deadline: deadline_at,
            deadline_secs: deadline.as_secs(),
            status: Status::Pending,
            status_reason: None,
            ended_at: None,
            fatal: None,
            resources,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status.is_terminal()
    }

    /// The root application's resources.
    pub fn application(&self) -> Option<&ApplicationResources> {
        self.resources.applications.get(&self.identity.application)
    }

    pub fn application_mut(&mut self, name: &str) -> &mut ApplicationResources {
        self.resources.applications.entry(name.to_string()).or_default()
    }

    /// Take the latest controller report. Returns `false` when nothing changed.
    pub fn refresh_target(&mut self, target: RolloutTarget) -> bool {
        if self.target == target {
            return false;
        }
        if let Some(desired) = target.desired {
            self.desired_replicas = desired;
        }
        self.target = target;
        true
    }

    /// Pending -> Running on the first child observation.
    pub fn note_child_observation(&mut self) {
        if self.status == Status::Pending {
            self.status = Status::Running;
        }
    }

    pub fn transition(&mut self, next: Status, reason: Option<String>, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if reason.is_some() {
            self.status_reason = reason;
        }
        if next.is_terminal() {
            self.ended_at = Some(at);
        }
        true
    }

    /// Record an unrecoverable watcher error as a synthetic Warning on the root events.
    pub fn flag_fatal(&mut self, reason: &str, message: impl Into<String>, at: DateTime<Utc>) {
        if self.fatal.is_none() {
            self.fatal = Some(reason.to_string());
        }
        let app = self.identity.application.clone();
        self.application_mut(&app).root_events.insert(EventRecord::synthetic(reason, message, at));
    }

    pub fn total_pods(&self) -> usize {
        self.resources.applications.values().map(|a| a.pods.len()).sum()
    }
}
