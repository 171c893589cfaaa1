use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rusqlite::{params, ErrorCode, OptionalExtension};
use tidewatch_core::{DeploymentNarrative, Error, Identity, Result, Status};
use tracing::debug;

use crate::DeploymentStore;

/// One row as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDeployment {
    pub status: Status,
    pub ended_at: Option<DateTime<Utc>>,
    pub narrative: DeploymentNarrative,
}

/// SQLite-backed store: one row per identity, the narrative as a JSON document.
/// Statements run on the blocking pool so the registry writer never stalls a
/// runtime worker.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let started = Instant::now();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(std::time::Duration::from_millis(500)).ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS deployments (
                cluster     TEXT NOT NULL,
                namespace   TEXT NOT NULL,
                application TEXT NOT NULL,
                generation  INTEGER NOT NULL,
                status      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                ended_at    TEXT,
                narrative   TEXT NOT NULL,
                PRIMARY KEY (cluster, namespace, application, generation)
            )",
            [],
        )
        .context("creating deployments table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_deployments_open ON deployments(ended_at)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> std::result::Result<T, rusqlite::Error> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let started = Instant::now();
        let res = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::StorageTransient(format!("{op}: blocking task failed: {e}")))?;
        histogram!("storage_write_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        res.map_err(|e| classify(op, e))
    }

    pub async fn get(&self, identity: &Identity) -> Result<Option<StoredDeployment>> {
        let id = identity.clone();
        let row = self
            .blocking("get", move |db| {
                db.query_row(
                    "SELECT status, ended_at, narrative FROM deployments
                     WHERE cluster = ?1 AND namespace = ?2 AND application = ?3 AND generation = ?4",
                    params![id.cluster, id.namespace, id.application, id.generation],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()
            })
            .await?;
        let Some((status, ended_at, narrative)) = row else { return Ok(None) };
        let status: Status = status.parse().map_err(|e: Error| Error::StoragePermanent(e.to_string()))?;
        let ended_at = ended_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| Error::StoragePermanent(format!("bad ended_at: {e}")))?;
        let narrative = serde_json::from_str(&narrative).map_err(|e| Error::StoragePermanent(format!("bad narrative json: {e}")))?;
        Ok(Some(StoredDeployment { status, ended_at, narrative }))
    }

    /// Rows that were never completed.
    pub async fn count_open(&self) -> Result<u64> {
        self.blocking("count_open", |db| {
            db.query_row("SELECT COUNT(*) FROM deployments WHERE ended_at IS NULL", [], |row| row.get::<_, i64>(0))
        })
        .await
        .map(|n| n.max(0) as u64)
    }
}

fn classify(op: &str, e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            Error::StorageTransient(format!("{op}: {e}"))
        }
        _ => Error::StoragePermanent(format!("{op}: {e}")),
    }
}

#[async_trait::async_trait]
impl DeploymentStore for SqliteStore {
    async fn upsert_deployment(&self, narrative: &DeploymentNarrative) -> Result<()> {
        let json = serde_json::to_string(narrative).map_err(|e| Error::StoragePermanent(format!("encoding narrative: {e}")))?;
        let id = narrative.identity.clone();
        let status = narrative.status.as_str();
        let created_at = narrative.created_at.to_rfc3339();
        debug!(identity = %id, %status, "sqlite upsert");
        // Completed rows are never downgraded by a late upsert.
        self.blocking("upsert", move |db| {
            db.execute(
                "INSERT INTO deployments(cluster, namespace, application, generation, status, created_at, narrative)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(cluster, namespace, application, generation) DO UPDATE
                   SET status = excluded.status, narrative = excluded.narrative
                   WHERE deployments.ended_at IS NULL",
                params![id.cluster, id.namespace, id.application, id.generation, status, created_at, json],
            )
        })
        .await?;
        counter!("persist_upsert_total", 1u64);
        Ok(())
    }

    async fn reset_deployment(&self, narrative: &DeploymentNarrative) -> Result<()> {
        let json = serde_json::to_string(narrative).map_err(|e| Error::StoragePermanent(format!("encoding narrative: {e}")))?;
        let id = narrative.identity.clone();
        let status = narrative.status.as_str();
        let created_at = narrative.created_at.to_rfc3339();
        debug!(identity = %id, %status, "sqlite reset");
        self.blocking("reset", move |db| {
            db.execute(
                "INSERT INTO deployments(cluster, namespace, application, generation, status, created_at, narrative)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(cluster, namespace, application, generation) DO UPDATE
                   SET status = excluded.status, created_at = excluded.created_at,
                       ended_at = NULL, narrative = excluded.narrative",
                params![id.cluster, id.namespace, id.application, id.generation, status, created_at, json],
            )
        })
        .await?;
        counter!("persist_reset_total", 1u64);
        Ok(())
    }

    async fn complete_deployment(&self, identity: &Identity, status: Status, ended_at: DateTime<Utc>) -> Result<()> {
        let id = identity.clone();
        let ended = ended_at.to_rfc3339();
        let updated = self
            .blocking("complete", move |db| {
                db.execute(
                    "UPDATE deployments SET status = ?5, ended_at = ?6
                     WHERE cluster = ?1 AND namespace = ?2 AND application = ?3 AND generation = ?4 AND ended_at IS NULL",
                    params![id.cluster, id.namespace, id.application, id.generation, status.as_str(), ended],
                )
            })
            .await?;
        if updated == 0 {
            debug!(identity = %identity, "complete matched no open row");
        }
        counter!("persist_complete_total", 1u64);
        Ok(())
    }
}

/// `~/.tidewatch/tidewatch.db`, or `tidewatch.db` in the working directory without HOME.
pub fn default_db_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".tidewatch");
        p.push("tidewatch.db");
        return p;
    }
    PathBuf::from("tidewatch.db")
}
