//! Tidewatch persistence: where sealed and in-flight narratives end up.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};
use tidewatch_core::{DeploymentNarrative, Identity, Result, Status};

pub use memory::{MemoryStore, StoreCall};
pub use sqlite::{default_db_path, SqliteStore, StoredDeployment};

/// Storage contract the registry writes through.
///
/// `upsert_deployment` is idempotent per identity and is called with monotonically
/// enriched narratives; `complete_deployment` seals the row and later upserts leave a
/// sealed row alone. `reset_deployment` replaces the row outright, completion
/// included, for an object that was deleted and re-created. Implementations return
/// `StorageTransient` for conditions worth retrying and `StoragePermanent` otherwise.
#[async_trait::async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn upsert_deployment(&self, narrative: &DeploymentNarrative) -> Result<()>;
    async fn reset_deployment(&self, narrative: &DeploymentNarrative) -> Result<()>;
    async fn complete_deployment(&self, identity: &Identity, status: Status, ended_at: DateTime<Utc>) -> Result<()>;
}
