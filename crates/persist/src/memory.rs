use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tidewatch_core::{DeploymentNarrative, Error, Identity, Result, Status};

use crate::DeploymentStore;

/// One successful call, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Upsert { identity: Identity, status: Status, at: Instant },
    Reset { identity: Identity, at: Instant },
    Complete { identity: Identity, status: Status, ended_at: DateTime<Utc>, at: Instant },
}

impl StoreCall {
    pub fn identity(&self) -> &Identity {
        match self {
            StoreCall::Upsert { identity, .. } | StoreCall::Reset { identity, .. } | StoreCall::Complete { identity, .. } => identity,
        }
    }

    pub fn at(&self) -> Instant {
        match self {
            StoreCall::Upsert { at, .. } | StoreCall::Reset { at, .. } | StoreCall::Complete { at, .. } => *at,
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<StoreCall>,
    rows: BTreeMap<Identity, DeploymentNarrative>,
    completed: BTreeMap<Identity, (Status, DateTime<Utc>)>,
    fault: Option<Error>,
    fail_next: u32,
    attempts: u64,
}

/// Recording store for tests and `--dry-run` style setups.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every call with `err` until cleared.
    pub fn set_fault(&self, err: Option<Error>) {
        self.state().fault = err;
    }

    /// Fail only the next `n` calls with `err`.
    pub fn fail_next(&self, n: u32, err: Error) {
        let mut st = self.state();
        st.fail_next = n;
        st.fault = Some(err);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Calls made, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.state().attempts
    }

    pub fn last_write_at(&self) -> Option<Instant> {
        self.state().calls.last().map(StoreCall::at)
    }

    pub fn narrative(&self, identity: &Identity) -> Option<DeploymentNarrative> {
        self.state().rows.get(identity).cloned()
    }

    pub fn completed(&self, identity: &Identity) -> Option<(Status, DateTime<Utc>)> {
        self.state().completed.get(identity).copied()
    }

    fn check_fault(st: &mut State) -> Result<()> {
        st.attempts += 1;
        let Some(err) = st.fault.clone() else { return Ok(()) };
        if st.fail_next > 0 {
            st.fail_next -= 1;
            if st.fail_next == 0 {
                st.fault = None;
            }
        }
        Err(err)
    }
}

#[async_trait::async_trait]
impl DeploymentStore for MemoryStore {
    async fn upsert_deployment(&self, narrative: &DeploymentNarrative) -> Result<()> {
        let mut st = self.state();
        Self::check_fault(&mut st)?;
        let identity = narrative.identity.clone();
        if !st.completed.contains_key(&identity) {
            st.rows.insert(identity.clone(), narrative.clone());
        }
        st.calls.push(StoreCall::Upsert { identity, status: narrative.status, at: Instant::now() });
        Ok(())
    }

    async fn reset_deployment(&self, narrative: &DeploymentNarrative) -> Result<()> {
        let mut st = self.state();
        Self::check_fault(&mut st)?;
        let identity = narrative.identity.clone();
        st.completed.remove(&identity);
        st.rows.insert(identity.clone(), narrative.clone());
        st.calls.push(StoreCall::Reset { identity, at: Instant::now() });
        Ok(())
    }

    async fn complete_deployment(&self, identity: &Identity, status: Status, ended_at: DateTime<Utc>) -> Result<()> {
        let mut st = self.state();
        Self::check_fault(&mut st)?;
        st.completed.entry(identity.clone()).or_insert((status, ended_at));
        st.calls.push(StoreCall::Complete { identity: identity.clone(), status, ended_at, at: Instant::now() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn records_calls_and_injects_faults() {
        let store = MemoryStore::new();
        let n = DeploymentNarrative::new(Identity::new("c", "pe", "app", 1), "Deployment", 1, Duration::from_secs(5), Utc::now());
        store.fail_next(2, Error::StorageTransient("busy".into()));
        assert!(store.upsert_deployment(&n).await.is_err());
        assert!(store.upsert_deployment(&n).await.is_err());
        store.upsert_deployment(&n).await.unwrap();
        store.complete_deployment(&n.identity, Status::Succeeded, Utc::now()).await.unwrap();
        assert_eq!(store.attempts(), 4);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.completed(&n.identity).map(|c| c.0), Some(Status::Succeeded));
        assert!(store.narrative(&n.identity).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_reopens_a_completed_row() {
        let store = MemoryStore::new();
        let mut n = DeploymentNarrative::new(Identity::new("c", "pe", "app", 1), "Deployment", 1, Duration::from_secs(5), Utc::now());
        store.upsert_deployment(&n).await.unwrap();
        store.complete_deployment(&n.identity, Status::Cancelled, Utc::now()).await.unwrap();
        n.status = Status::Running;
        store.upsert_deployment(&n).await.unwrap();
        assert_eq!(store.narrative(&n.identity).map(|r| r.status), Some(Status::Pending));

        store.reset_deployment(&n).await.unwrap();
        assert!(store.completed(&n.identity).is_none());
        assert_eq!(store.narrative(&n.identity).map(|r| r.status), Some(Status::Running));
        assert!(matches!(store.calls().last(), Some(StoreCall::Reset { .. })));
    }
}
