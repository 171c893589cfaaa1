//! Tidewatch core types: deployment narratives, label selectors, error taxonomy,
//! retry policy and process settings. Nothing in here talks to the cluster.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod error;
pub mod model;
pub mod selector;
pub mod settings;

pub use backoff::{Backoff, BackoffPolicy};
pub use error::{Error, Result};
pub use model::{
    ApplicationResources, DeploymentNarrative, EventLog, EventRecord, EventType, Identity,
    PhaseTransition, PodObservation, PodPhase, PodRecord, ReplicasetChange, ReplicasetObservation,
    ReplicasetRecord, Resources, RolloutTarget, Status, REVISION_LABEL,
};
pub use selector::LabelSelector;
pub use settings::Settings;

pub mod prelude {
    pub use super::{
        DeploymentNarrative, Error, EventRecord, EventType, Identity, LabelSelector, PodPhase,
        Result, Status,
    };
}

/// Warning reasons that count against a rollout.
pub const FAILURE_EVENT_REASONS: &[&str] = &["FailedCreate", "FailedScheduling", "BackOff"];
