//! Job queue and status map, backed by SQLite.
//!
//! Both live in one database file so every worker process on a host shares
//! them. Named queues and hashes keep the shape of the key-value service the
//! ingestion side writes to: a list called [`BUILD_QUEUE`] and a hash called
//! [`STATUS_MAP`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::models::{
    BUILD_QUEUE, DeploymentId, DeploymentStatus, STATUS_MAP, StatusRecord, StatusTransition,
    is_valid_transition,
};
use crate::errors::DeployError;

/// Durable FIFO of deployment ids.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append an id at the tail.
    async fn push(&self, id: &DeploymentId) -> Result<()>;

    /// Atomically remove and return the head, or `None` when empty. Entries are
    /// returned raw; the caller validates them.
    async fn pop(&self) -> Result<Option<String>>;

    async fn len(&self) -> Result<usize>;
}

/// Shared deployment-id → status table.
#[async_trait]
pub trait StatusMap: Send + Sync {
    /// Upsert a status. Regressions are rejected with
    /// `DeployError::InvalidStatusTransition`; backend failures are
    /// `DeployError::Status`.
    async fn set(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> Result<StatusRecord, DeployError>;

    async fn get(&self, id: &DeploymentId) -> Result<Option<StatusRecord>>;

    /// Accepted writes for `id`, oldest first.
    async fn history(&self, id: &DeploymentId) -> Result<Vec<StatusTransition>>;
}

enum SetOutcome {
    Written(StatusRecord),
    Rejected(DeploymentStatus),
}

/// Async-safe handle to the broker database.
///
/// Runs every statement on tokio's blocking pool via `spawn_blocking`, the
/// same way the connection is shared between the worker loop and the CLI.
#[derive(Clone)]
pub struct SqliteBroker {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBroker {
    /// Open (or create) the broker database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open broker database {}", path.display()))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        Self::init(conn)
    }

    /// In-memory broker (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory broker database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                value TEXT NOT NULL,
                enqueued_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hash_fields (
                hash TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (hash, field)
            );

            CREATE TABLE IF NOT EXISTS status_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                deployment TEXT NOT NULL,
                status TEXT NOT NULL,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_entries_queue ON queue_entries(queue, seq);
            CREATE INDEX IF NOT EXISTS idx_status_transitions_deployment
                ON status_transitions(deployment, id);
            ",
        )
        .context("Failed to create broker tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Broker lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("Broker task panicked")?
    }
}

impl SqliteBroker {
    /// Append an unvalidated entry, as an external producer sharing the
    /// database may.
    pub async fn push_raw(&self, entry: &str) -> Result<()> {
        let value = entry.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO queue_entries (queue, value, enqueued_at) VALUES (?1, ?2, ?3)",
                params![BUILD_QUEUE, value, Utc::now().to_rfc3339()],
            )
            .context("Failed to push queue entry")?;
            Ok(())
        })
        .await
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

#[async_trait]
impl JobQueue for SqliteBroker {
    async fn push(&self, id: &DeploymentId) -> Result<()> {
        self.push_raw(id.as_str()).await
    }

    async fn pop(&self) -> Result<Option<String>> {
        self.call(|conn| {
            // Taking the write lock up front makes the head read and its
            // removal one step for every process sharing the file.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("Failed to begin pop transaction")?;
            let value = tx
                .query_row(
                    "DELETE FROM queue_entries
                     WHERE seq = (SELECT seq FROM queue_entries WHERE queue = ?1 ORDER BY seq LIMIT 1)
                     RETURNING value",
                    params![BUILD_QUEUE],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("Failed to pop queue entry")?;
            tx.commit().context("Failed to commit pop")?;
            Ok(value)
        })
        .await
    }

    async fn len(&self) -> Result<usize> {
        self.call(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE queue = ?1",
                    params![BUILD_QUEUE],
                    |row| row.get(0),
                )
                .context("Failed to count queue entries")?;
            Ok(n as usize)
        })
        .await
    }
}

#[async_trait]
impl StatusMap for SqliteBroker {
    async fn set(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> Result<StatusRecord, DeployError> {
        let owned_id = id.clone();
        let outcome = self
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .context("Failed to begin status transaction")?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT value FROM hash_fields WHERE hash = ?1 AND field = ?2",
                        params![STATUS_MAP, owned_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("Failed to read current status")?;
                if let Some(current) = current {
                    let current: DeploymentStatus =
                        current.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                    if !is_valid_transition(current, status) {
                        return Ok(SetOutcome::Rejected(current));
                    }
                    if current.is_terminal() && status == DeploymentStatus::Building {
                        tracing::warn!(
                            deployment = %owned_id,
                            previous = %current,
                            "rebuilding deployment"
                        );
                    }
                }

                let now = Utc::now();
                tx.execute(
                    "INSERT INTO hash_fields (hash, field, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(hash, field) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![STATUS_MAP, owned_id.as_str(), status.as_str(), now.to_rfc3339()],
                )
                .context("Failed to write status")?;
                tx.execute(
                    "INSERT INTO status_transitions (deployment, status, at) VALUES (?1, ?2, ?3)",
                    params![owned_id.as_str(), status.as_str(), now.to_rfc3339()],
                )
                .context("Failed to record status transition")?;
                tx.commit().context("Failed to commit status write")?;

                Ok(SetOutcome::Written(StatusRecord {
                    id: owned_id,
                    status,
                    updated_at: now,
                }))
            })
            .await
            .map_err(DeployError::Status)?;

        match outcome {
            SetOutcome::Written(record) => Ok(record),
            SetOutcome::Rejected(from) => Err(DeployError::InvalidStatusTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: status.to_string(),
            }),
        }
    }

    async fn get(&self, id: &DeploymentId) -> Result<Option<StatusRecord>> {
        let id = id.clone();
        self.call(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT value, updated_at FROM hash_fields WHERE hash = ?1 AND field = ?2",
                    params![STATUS_MAP, id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("Failed to read status")?;
            row.map(|(value, updated_at)| {
                Ok(StatusRecord {
                    status: value.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    updated_at: parse_timestamp(&updated_at)?,
                    id: id.clone(),
                })
            })
            .transpose()
        })
        .await
    }

    async fn history(&self, id: &DeploymentId) -> Result<Vec<StatusTransition>> {
        let id = id.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT status, at FROM status_transitions WHERE deployment = ?1 ORDER BY id",
                )
                .context("Failed to prepare history query")?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .context("Failed to query status history")?;
            let mut history = Vec::new();
            for row in rows {
                let (status, at) = row.context("Failed to read history row")?;
                history.push(StatusTransition {
                    status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    at: parse_timestamp(&at)?,
                });
            }
            Ok(history)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> DeploymentId {
        DeploymentId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_queue_is_fifo() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        broker.push(&id("aaaaa")).await?;
        broker.push(&id("bbbbb")).await?;
        broker.push(&id("ccccc")).await?;
        assert_eq!(broker.len().await?, 3);

        assert_eq!(broker.pop().await?.as_deref(), Some("aaaaa"));
        assert_eq!(broker.pop().await?.as_deref(), Some("bbbbb"));
        assert_eq!(broker.pop().await?.as_deref(), Some("ccccc"));
        assert_eq!(broker.pop().await?, None);
        assert_eq!(broker.len().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_pops_never_duplicate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broker.db");
        let producer = SqliteBroker::open(&path)?;
        for i in 0..50 {
            producer.push(&id(&format!("{:05}", i))).await?;
        }

        // Separate connections to the same file, as separate worker processes would have.
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let consumer = SqliteBroker::open(&path)?;
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(v) = consumer.pop().await.unwrap() {
                    got.push(v);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for t in tasks {
            all.extend(t.await?);
        }
        assert_eq!(all.len(), 50);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_set_get_and_history() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        let d = id("abc12");
        assert!(broker.get(&d).await?.is_none());

        broker.set(&d, DeploymentStatus::Uploaded).await?;
        broker.set(&d, DeploymentStatus::Building).await?;
        broker.set(&d, DeploymentStatus::Deployed).await?;

        let record = broker.get(&d).await?.unwrap();
        assert_eq!(record.status, DeploymentStatus::Deployed);

        let history: Vec<_> = broker.history(&d).await?.into_iter().map(|t| t.status).collect();
        assert_eq!(
            history,
            vec![
                DeploymentStatus::Uploaded,
                DeploymentStatus::Building,
                DeploymentStatus::Deployed
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_never_regresses_to_uploaded() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        let d = id("abc12");
        broker.set(&d, DeploymentStatus::Building).await?;
        broker.set(&d, DeploymentStatus::Failed).await?;

        let err = broker.set(&d, DeploymentStatus::Uploaded).await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidStatusTransition { .. }));
        assert_eq!(broker.get(&d).await?.unwrap().status, DeploymentStatus::Failed);
        // rejected writes leave no trace in the history
        assert_eq!(broker.history(&d).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rebuild_from_terminal_state_is_allowed() -> Result<()> {
        let broker = SqliteBroker::open_in_memory()?;
        let d = id("abc12");
        broker.set(&d, DeploymentStatus::Building).await?;
        broker.set(&d, DeploymentStatus::Failed).await?;
        broker.set(&d, DeploymentStatus::Building).await?;
        broker.set(&d, DeploymentStatus::Deployed).await?;
        assert_eq!(broker.get(&d).await?.unwrap().status, DeploymentStatus::Deployed);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("broker.db");
        {
            let broker = SqliteBroker::open(&path)?;
            broker.set(&id("abc12"), DeploymentStatus::Uploaded).await?;
            broker.push(&id("abc12")).await?;
        }
        let broker = SqliteBroker::open(&path)?;
        assert_eq!(
            broker.get(&id("abc12")).await?.unwrap().status,
            DeploymentStatus::Uploaded
        );
        assert_eq!(broker.pop().await?.as_deref(), Some("abc12"));
        Ok(())
    }
}
