//! Progress state machine: a pure evaluation over a narrative snapshot plus the
//! per-narrative driver task that applies its verdict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tidewatch_core::{DeploymentNarrative, PodPhase, Status, FAILURE_EVENT_REASONS};
use tidewatch_store::Slot;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::{Shared, WatchContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressPolicy {
    /// How long ready == desired must hold before success.
    pub stabilisation_window: Duration,
    pub max_pod_failures: u32,
    pub max_warning_events: u32,
    /// Re-evaluation period when nothing changes.
    pub tick: Duration,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            stabilisation_window: Duration::from_secs(10),
            max_pod_failures: 3,
            max_warning_events: 5,
            tick: Duration::from_millis(250),
        }
    }
}

/// When the rollout last became fully ready. Carried between evaluations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stability {
    pub ready_since: Option<DateTime<Utc>>,
}

/// Terminal verdict for `n` at `now`, if any.
pub fn evaluate(
    n: &DeploymentNarrative,
    policy: &ProgressPolicy,
    now: DateTime<Utc>,
    stability: &mut Stability,
) -> Option<(Status, Option<String>)> {
    if n.is_sealed() {
        return None;
    }
    if let Some(reason) = n.fatal.as_ref() {
        return Some((Status::Failed, Some(reason.clone())));
    }
    if now >= n.deadline {
        return Some((Status::TimedOut, Some("deadline-exceeded".into())));
    }
    if n.status == Status::Pending {
        stability.ready_since = None;
        return None;
    }
    let app = n.application()?;
    let pods = app.current_pods(n.target.update_revision.as_deref());

    if pods.iter().any(|p| p.failure_count() >= policy.max_pod_failures as usize) {
        return Some((Status::Failed, Some("max-pod-failures".into())));
    }

    let mut warnings: u32 = pods.iter().map(|p| p.events.warning_count(FAILURE_EVENT_REASONS)).sum();
    match app.current_replicaset() {
        Some(rs) => warnings += rs.events.warning_count(FAILURE_EVENT_REASONS),
        None if app.replicasets.is_empty() => warnings += app.root_events.warning_count(FAILURE_EVENT_REASONS),
        None => {}
    }
    if warnings >= policy.max_warning_events {
        return Some((Status::Failed, Some("max-warning-events".into())));
    }

    let live: Vec<_> = pods.iter().filter(|p| p.is_live()).collect();
    let ready = live.iter().filter(|p| p.ready && p.current_phase() == Some(PodPhase::Running)).count();
    let unhealthy = live.iter().any(|p| p.is_unhealthy());
    let target_met = n.target.desired.is_some_and(|desired| ready as i64 == i64::from(desired)) && n.target.fully_updated();
    if target_met && !unhealthy {
        let since = *stability.ready_since.get_or_insert(now);
        let held = (now - since).to_std().unwrap_or(Duration::ZERO);
        if held >= policy.stabilisation_window {
            return Some((Status::Succeeded, None));
        }
    } else {
        stability.ready_since = None;
    }
    None
}

/// Re-evaluate on every published change, on a tick, and at the deadline. Seals the
/// narrative, then cancels its subtree.
pub(crate) async fn drive(shared: Arc<Shared>, slot: Slot, ctx: WatchContext, policy: ProgressPolicy) {
    let registry = shared.registry.clone();
    let mut changes = registry.changes(&slot);
    let mut ticker = tokio::time::interval(policy.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stability = Stability::default();

    loop {
        let n = slot.current();
        if n.is_sealed() {
            break;
        }
        let now = Utc::now();
        if let Some((status, reason)) = evaluate(&n, &policy, now, &mut stability) {
            registry.seal(&slot, status, reason).await;
            break;
        }
        let until_deadline = (n.deadline - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = ctx.token.cancelled() => {
                registry.seal(&slot, Status::Cancelled, Some("context-cancelled".into())).await;
                break;
            }
            _ = tokio::time::sleep(until_deadline) => {}
            _ = ticker.tick() => {}
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    ctx.token.cancel();
    debug!(identity = %slot.identity(), status = %slot.current().status, "progress driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tidewatch_core::{
        EventRecord, EventType, Identity, LabelSelector, PodObservation, ReplicasetObservation, RolloutTarget, REVISION_LABEL,
    };

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn policy() -> ProgressPolicy {
        ProgressPolicy { stabilisation_window: Duration::from_secs(10), ..ProgressPolicy::default() }
    }

    fn narrative(desired: i32) -> DeploymentNarrative {
        let id = Identity::new("c", "pe", "app", 1);
        DeploymentNarrative::new(id, "Deployment", desired, Duration::from_secs(60), ts(0))
    }

    fn pod(name: &str, phase: PodPhase, ready: bool) -> PodObservation {
        PodObservation {
            name: name.into(),
            labels: [("app".to_string(), "app".to_string())].into_iter().collect(),
            phase,
            ready,
            crash_looping: false,
            created_at: None,
            owner_replicaset: None,
        }
    }

    fn warning(name: &str, reason: &str, at: i64) -> EventRecord {
        EventRecord {
            name: name.into(),
            message: "m".into(),
            reason: reason.into(),
            kind: EventType::Warning,
            source: "kubelet".into(),
            first_seen: ts(at),
            last_seen: ts(at),
            count: 1,
        }
    }

    #[test]
    fn pending_waits_for_children() {
        let n = narrative(1);
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(30_000), &mut st), None);
    }

    #[test]
    fn success_needs_the_stabilisation_window() {
        let mut n = narrative(1);
        n.note_child_observation();
        n.application_mut("app").observe_pod(pod("p-1", PodPhase::Running, true), ts(0));
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(1_000), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(5_000), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(11_000), &mut st), Some((Status::Succeeded, None)));
    }

    #[test]
    fn losing_readiness_restarts_the_window() {
        let mut n = narrative(1);
        n.note_child_observation();
        n.application_mut("app").observe_pod(pod("p-1", PodPhase::Running, true), ts(0));
        let mut st = Stability::default();
        evaluate(&n, &policy(), ts(1_000), &mut st);
        n.application_mut("app").observe_pod(pod("p-1", PodPhase::Running, false), ts(2_000));
        assert_eq!(evaluate(&n, &policy(), ts(2_000), &mut st), None);
        assert_eq!(st.ready_since, None);
        n.application_mut("app").observe_pod(pod("p-1", PodPhase::Running, true), ts(3_000));
        assert_eq!(evaluate(&n, &policy(), ts(3_000), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(11_500), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(13_500), &mut st), Some((Status::Succeeded, None)));
    }

    #[test]
    fn unconfirmed_desired_count_is_never_ready() {
        let id = Identity::new("c", "pe", "agent", 1);
        let mut n = DeploymentNarrative::new(id, "DaemonSet", 0, Duration::from_secs(60), ts(0));
        n.target = RolloutTarget::default();
        n.note_child_observation();
        n.application_mut("agent").observe_pod(pod("ds-1", PodPhase::Pending, false), ts(0));
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(1_000), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(20_000), &mut st), None);
        assert_eq!(st.ready_since, None);
    }

    #[test]
    fn previous_revision_pods_do_not_count_as_ready() {
        let id = Identity::new("c", "pe", "db", 2);
        let mut n = DeploymentNarrative::new(id, "StatefulSet", 2, Duration::from_secs(60), ts(0));
        n.refresh_target(RolloutTarget { desired: Some(2), updated: Some(0), update_revision: Some("db-new".into()) });
        n.note_child_observation();
        for name in ["db-0", "db-1"] {
            let mut p = pod(name, PodPhase::Running, true);
            p.labels.insert(REVISION_LABEL.to_string(), "db-old".into());
            n.application_mut("db").observe_pod(p, ts(0));
        }
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(1_000), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(20_000), &mut st), None);

        for name in ["db-0", "db-1"] {
            let mut p = pod(name, PodPhase::Running, true);
            p.labels.insert(REVISION_LABEL.to_string(), "db-new".into());
            n.application_mut("db").observe_pod(p, ts(21_000));
        }
        // pods replaced, but the controller has not reported them updated yet
        assert_eq!(evaluate(&n, &policy(), ts(21_000), &mut st), None);
        n.refresh_target(RolloutTarget { desired: Some(2), updated: Some(2), update_revision: Some("db-new".into()) });
        assert_eq!(evaluate(&n, &policy(), ts(22_000), &mut st), None);
        assert_eq!(evaluate(&n, &policy(), ts(32_000), &mut st), Some((Status::Succeeded, None)));
    }

    #[test]
    fn deadline_times_out() {
        let mut n = narrative(2);
        n.note_child_observation();
        n.application_mut("app").observe_pod(pod("p-1", PodPhase::Running, true), ts(0));
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(59_999), &mut st), None);
        let verdict = evaluate(&n, &policy(), ts(60_000), &mut st);
        assert_eq!(verdict.map(|v| v.0), Some(Status::TimedOut));
    }

    #[test]
    fn repeated_pod_failures_fail_the_rollout() {
        let mut n = narrative(1);
        n.note_child_observation();
        let app = n.application_mut("app");
        for i in 0..3 {
            app.observe_pod(pod("p-1", PodPhase::Running, true), ts(i * 10));
            app.observe_pod(pod("p-1", PodPhase::Failed, false), ts(i * 10 + 5));
        }
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(100), &mut st), Some((Status::Failed, Some("max-pod-failures".into()))));
    }

    #[test]
    fn warnings_count_against_the_current_replicaset_only() {
        let mut n = narrative(1);
        n.note_child_observation();
        let app = n.application_mut("app");
        for (name, created) in [("rs-old", 0), ("rs-new", 10)] {
            app.upsert_replicaset(
                ReplicasetObservation {
                    name: name.into(),
                    created_at: ts(created),
                    desired: 1,
                    current: 0,
                    ready: 0,
                    selector: LabelSelector::from_labels([("pod-template-hash", name)]),
                },
                ts(created),
            );
        }
        for i in 0..5 {
            app.record_replicaset_event("rs-old", warning(&format!("old-{i}"), "FailedCreate", i));
        }
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(100), &mut st), None);

        let app = n.application_mut("app");
        for i in 0..4 {
            app.record_replicaset_event("rs-new", warning(&format!("new-{i}"), "FailedCreate", i));
        }
        // unlisted reasons never count
        app.record_replicaset_event("rs-new", warning("other", "Unhealthy", 9));
        assert_eq!(evaluate(&n, &policy(), ts(100), &mut st), None);
        n.application_mut("app").record_replicaset_event("rs-new", warning("new-4", "BackOff", 9));
        assert_eq!(evaluate(&n, &policy(), ts(100), &mut st), Some((Status::Failed, Some("max-warning-events".into()))));
    }

    #[test]
    fn fatal_flags_win_and_sealed_narratives_are_left_alone() {
        let mut n = narrative(1);
        n.flag_fatal("watch-permission", "forbidden", ts(1));
        let mut st = Stability::default();
        assert_eq!(evaluate(&n, &policy(), ts(2), &mut st), Some((Status::Failed, Some("watch-permission".into()))));
        n.transition(Status::Failed, Some("watch-permission".into()), ts(3));
        assert_eq!(evaluate(&n, &policy(), ts(4), &mut st), None);
    }
}
