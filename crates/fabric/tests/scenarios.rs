#![forbid(unsafe_code)]

mod support;

use std::time::Duration;

use chrono::Utc;
use tidewatch_core::settings::WatchKind;
use tidewatch_core::{Status, REVISION_LABEL};
use tidewatch_fabric::DEADLINE_ANNOTATION;
use tidewatch_kubehub::fake::{build, FakeKind};

use support::{config, config_for, eventually, id, Harness, NS};

const APP: &[(&str, &str)] = &[("app", "app")];

fn hashed(hash: &str) -> Vec<(&'static str, &str)> {
    vec![("app", "app"), ("pod-template-hash", hash)]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_replicaset_succeeds() {
    let h = Harness::start(config(300));
    h.fake.apply_deployment(build::deployment(NS, "app", 1, 1, APP));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-1", &hashed("pod-1"), Some("app"), Utc::now()));
    h.fake.apply_pod(build::pod(NS, "p-1", &hashed("pod-1"), "Running", Some("rs-1")));

    let n = h.wait_for(&id("app", 1), Duration::from_secs(5), |n| n.is_sealed()).await;
    assert_eq!(n.status, Status::Succeeded);
    let app = n.application().unwrap();
    assert_eq!(app.replicasets.len(), 1);
    assert_eq!(app.pods.len(), 1);
    assert!(app.root_events.is_empty());
    assert_eq!(app.pods["p-1"].replicaset.as_deref(), Some("rs-1"));
    h.stop().await;
    assert_eq!(h.store.completed(&id("app", 1)).map(|c| c.0), Some(Status::Succeeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_replicasets_two_failed_pods_one_event() {
    let h = Harness::start(config(300));
    h.fake.apply_deployment(build::deployment(NS, "app", 1, 2, APP));
    let t0 = Utc::now();
    h.fake.apply_replicaset(build::replicaset(NS, "rs-1", &hashed("pod-1"), Some("app"), t0));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-2", &hashed("pod-2"), Some("app"), t0 + chrono::Duration::seconds(1)));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-2", &hashed("pod-2"), Some("app"), t0 + chrono::Duration::seconds(1)));
    h.fake.apply_pod(build::pod(NS, "nginx", &hashed("pod-1"), "Failed", Some("rs-1")));
    h.fake.apply_pod(build::pod(NS, "nginx2", &hashed("pod-2"), "Failed", Some("rs-2")));
    h.fake.emit_event(build::event(NS, "rs-1.1", "ReplicaSet", "rs-1", "SuccessfulCreate", "Normal", Utc::now()));

    let n = h
        .wait_for(&id("app", 1), Duration::from_secs(5), |n| {
            n.application().is_some_and(|a| a.pods.len() == 2 && a.replicasets.get("rs-1").is_some_and(|rs| rs.events.len() == 1))
        })
        .await;
    let app = n.application().unwrap();
    assert_eq!(app.replicasets.len(), 2);
    assert_eq!(app.pods.len(), 2);
    assert_eq!(app.replicasets["rs-1"].events.len(), 1);
    assert!(app.replicasets["rs-2"].events.is_empty());
    assert_eq!(app.pods["nginx"].replicaset.as_deref(), Some("rs-1"));
    assert_eq!(app.pods["nginx2"].replicaset.as_deref(), Some("rs-2"));
    assert_eq!(n.status, Status::Running);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_replicaset_selector_observes_no_pods() {
    let h = Harness::start(config(300));
    h.fake.apply_deployment(build::deployment(NS, "app", 1, 1, APP));
    let mut rs = build::replicaset(NS, "rs-empty", APP, Some("app"), Utc::now());
    if let Some(spec) = rs.spec.as_mut() {
        spec.selector = Default::default();
    }
    h.fake.apply_replicaset(rs);
    h.wait_for(&id("app", 1), Duration::from_secs(3), |n| n.application().is_some_and(|a| a.replicasets.len() == 1)).await;
    h.fake.apply_pod(build::pod(NS, "p-1", APP, "Failed", Some("rs-empty")));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let n = h.narrative(&id("app", 1)).unwrap();
    let app = n.application().unwrap();
    assert_eq!(app.replicasets.len(), 1);
    assert_eq!(app.pods.len(), 0);
    assert_eq!(h.fake.watch_calls(FakeKind::Pod), 0);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_exceeded_times_out_and_tears_down() {
    let h = Harness::start(config(300));
    let baseline = h.fabric.task_count();
    let mut d = build::deployment(NS, "app", 1, 2, APP);
    build::annotate(&mut d.metadata, DEADLINE_ANNOTATION, "2");
    h.fake.apply_deployment(d);
    h.fake.apply_replicaset(build::replicaset(NS, "rs-1", &hashed("pod-1"), Some("app"), Utc::now()));
    h.fake.apply_pod(build::pod(NS, "p-1", &hashed("pod-1"), "Running", Some("rs-1")));
    h.fake.apply_pod(build::pod(NS, "p-2", &hashed("pod-1"), "Pending", Some("rs-1")));

    let n = h.wait_for(&id("app", 1), Duration::from_secs(4), |n| n.is_sealed()).await;
    assert_eq!(n.status, Status::TimedOut);
    assert_eq!(n.status_reason.as_deref(), Some("deadline-exceeded"));
    assert_eq!(n.deadline_secs, 2);
    assert_eq!(n.application().unwrap().pods.len(), 2);

    assert!(eventually(Duration::from_secs(2), || h.fabric.task_count() == baseline).await);
    assert!(eventually(Duration::from_secs(1), || h.fabric.events().subscriber_count() == 0).await);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pod_failure_threshold_fails_the_rollout() {
    let h = Harness::start(config(2_000));
    h.fake.apply_deployment(build::deployment(NS, "app", 1, 1, APP));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-1", &hashed("pod-1"), Some("app"), Utc::now()));
    let mut pod = build::pod(NS, "p-1", &hashed("pod-1"), "Running", Some("rs-1"));
    h.fake.apply_pod(pod.clone());
    h.wait_for(&id("app", 1), Duration::from_secs(3), |n| n.total_pods() == 1).await;

    for _ in 0..3 {
        build::set_phase(&mut pod, "Failed");
        h.fake.apply_pod(pod.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        build::set_phase(&mut pod, "Running");
        h.fake.apply_pod(pod.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let n = h.wait_for(&id("app", 1), Duration::from_secs(3), |n| n.is_sealed()).await;
    assert_eq!(n.status, Status::Failed);
    assert_eq!(n.status_reason.as_deref(), Some("max-pod-failures"));
    assert_eq!(n.application().unwrap().pods["p-1"].failure_count(), 3);
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rolling_overlap_attributes_pods_to_their_owner() {
    let h = Harness::start(config(5_000));
    let t0 = Utc::now();
    h.fake.apply_deployment(build::deployment(NS, "app", 1, 2, APP));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-old", &hashed("old"), Some("app"), t0));
    h.fake.apply_pod(build::pod(NS, "old-1", &hashed("old"), "Running", Some("rs-old")));
    h.wait_for(&id("app", 1), Duration::from_secs(3), |n| n.total_pods() == 1).await;

    h.fake.apply_deployment(build::deployment(NS, "app", 2, 2, APP));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-new", &hashed("new"), Some("app"), t0 + chrono::Duration::seconds(5)));
    for name in ["new-1", "new-2"] {
        h.fake.apply_pod(build::pod(NS, name, &hashed("new"), "Running", Some("rs-new")));
    }

    let n = h
        .wait_for(&id("app", 2), Duration::from_secs(5), |n| {
            n.application().is_some_and(|a| a.replicasets.len() == 2 && a.pods.len() == 3)
        })
        .await;
    let app = n.application().unwrap();
    for name in ["new-1", "new-2"] {
        let owners: Vec<&str> = app.replicasets.values().filter(|rs| rs.pods.contains(name)).map(|rs| rs.name.as_str()).collect();
        assert_eq!(owners, vec!["rs-new"], "pod {name}");
        assert_eq!(app.pods[name].replicaset.as_deref(), Some("rs-new"));
    }
    assert_eq!(app.pods["old-1"].replicaset.as_deref(), Some("rs-old"));
    assert_eq!(app.current_replicaset().map(|rs| rs.name.as_str()), Some("rs-new"));

    let old = h.narrative(&id("app", 1)).unwrap();
    assert_eq!(old.status, Status::Cancelled);
    assert_eq!(old.status_reason.as_deref(), Some("superseded"));
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemonset_waits_for_the_controller_count() {
    let h = Harness::start(config_for(WatchKind::Daemonset, 200));
    let labels = [("app", "agent")];
    let mut ds = build::daemonset(NS, "agent", 1, &labels);
    h.fake.apply_daemonset(ds.clone());
    h.fake.apply_pod(build::pod(NS, "agent-a", &labels, "Running", None));

    // Before the controller reports, a running pod proves nothing.
    let n = h.wait_for(&id("agent", 1), Duration::from_secs(3), |n| n.total_pods() == 1).await;
    assert_eq!(n.status, Status::Running);
    tokio::time::sleep(Duration::from_millis(600)).await;
    let n = h.narrative(&id("agent", 1)).unwrap();
    assert_eq!(n.status, Status::Running);
    assert_eq!(n.target.desired, None);

    build::observe_daemonset(&mut ds, 2, 2);
    h.fake.apply_daemonset(ds.clone());
    let n = h.wait_for(&id("agent", 1), Duration::from_secs(3), |n| n.target.desired == Some(2)).await;
    assert_eq!(n.desired_replicas, 2);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!h.narrative(&id("agent", 1)).unwrap().is_sealed());

    h.fake.apply_pod(build::pod(NS, "agent-b", &labels, "Running", None));
    let n = h.wait_for(&id("agent", 1), Duration::from_secs(5), |n| n.is_sealed()).await;
    assert_eq!(n.status, Status::Succeeded);
    assert_eq!(n.kind, "DaemonSet");
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statefulset_counts_only_update_revision_pods() {
    let h = Harness::start(config_for(WatchKind::Statefulset, 200));
    let old = [("app", "db"), (REVISION_LABEL, "db-v1")];
    let new = [("app", "db"), (REVISION_LABEL, "db-v2")];
    let mut sts = build::statefulset(NS, "db", 2, 2, &[("app", "db")]);
    build::observe_statefulset(&mut sts, "db-v2", 0);
    h.fake.apply_statefulset(sts.clone());
    for name in ["db-0", "db-1"] {
        h.fake.apply_pod(build::pod(NS, name, &old, "Running", None));
    }

    let n = h.wait_for(&id("db", 2), Duration::from_secs(3), |n| n.total_pods() == 2).await;
    assert_eq!(n.target.update_revision.as_deref(), Some("db-v2"));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.narrative(&id("db", 2)).unwrap().status, Status::Running);

    // The controller replaces pods in place, keeping their names.
    for name in ["db-1", "db-0"] {
        h.fake.apply_pod(build::pod(NS, name, &new, "Running", None));
    }
    build::observe_statefulset(&mut sts, "db-v2", 2);
    h.fake.apply_statefulset(sts);
    let n = h.wait_for(&id("db", 2), Duration::from_secs(5), |n| n.is_sealed()).await;
    assert_eq!(n.status, Status::Succeeded);
    assert_eq!(n.target.updated, Some(2));
    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warning_event_threshold_fails_the_rollout() {
    let h = Harness::start(config(5_000));
    h.fake.apply_deployment(build::deployment(NS, "app", 1, 1, APP));
    h.fake.apply_replicaset(build::replicaset(NS, "rs-1", &hashed("pod-1"), Some("app"), Utc::now()));
    h.fake.apply_pod(build::pod(NS, "p-1", &hashed("pod-1"), "Pending", Some("rs-1")));
    h.wait_for(&id("app", 1), Duration::from_secs(3), |n| n.total_pods() == 1).await;

    let t0 = Utc::now();
    for i in 0..5 {
        let seen = t0 + chrono::Duration::seconds(i);
        h.fake.emit_event(build::event(NS, &format!("p-1.backoff-{i}"), "Pod", "p-1", "BackOff", "Warning", seen));
    }

    let n = h.wait_for(&id("app", 1), Duration::from_secs(3), |n| n.is_sealed()).await;
    assert_eq!(n.status, Status::Failed);
    assert_eq!(n.status_reason.as_deref(), Some("max-warning-events"));
    assert_eq!(n.application().unwrap().pods["p-1"].events.len(), 5);
    h.stop().await;
    assert_eq!(h.store.completed(&id("app", 1)).map(|c| c.0), Some(Status::Failed));
}
