//! SQLite-backed durable storage.
//!
//! Uses a WAL-mode `sqlx` pool with foreign keys and a busy timeout. The
//! schema is created idempotently on connect, so no external migration
//! orchestration is required. Blobs and event payloads are stored as the
//! engine produced them (canonical JSON); the snapshot table additionally
//! indexes `flow_id`, `status`, and the two timestamps so listings do not
//! parse blobs.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::events::EventRecord;
use crate::runtimes::ExecutionStatus;

use super::{
    ExecutionFilter, ExecutionPage, ExecutionSummary, Lease, Page, PageInfo, Storage,
    StorageError, TaskResultRecord,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS snapshots (
        execution_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        blob BLOB NOT NULL,
        PRIMARY KEY (execution_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS events (
        execution_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        at TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (execution_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS task_results (
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (execution_id, node_id, attempt)
    )",
    "CREATE TABLE IF NOT EXISTS leases (
        execution_id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        token TEXT NOT NULL,
        ttl_ms INTEGER NOT NULL,
        expires_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_flow ON snapshots (flow_id, created_at)",
];

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend {
        message: e.to_string(),
    }
}

fn status_str(status: ExecutionStatus) -> String {
    // serde representation, e.g. "running".
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn status_from_str(s: &str) -> Result<ExecutionStatus, StorageError> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(Into::into)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Backend {
            message: format!("bad timestamp {s}: {e}"),
        })
}

/// Durable [`Storage`] backed by SQLite.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish()
    }
}

impl SqliteStorage {
    /// Connect to (or create) the database at `database_url`, e.g.
    /// `sqlite://rillflow.db`, and ensure the schema exists.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(backend)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(backend)?;
        }
        Ok(Self { pool })
    }

    /// Connect using `RILLFLOW_SQLITE_URL` (via the environment or a
    /// `.env` file), falling back to `sqlite://rillflow.db`.
    pub async fn connect_default() -> Result<Self, StorageError> {
        dotenvy::dotenv().ok();
        let url = std::env::var("RILLFLOW_SQLITE_URL")
            .unwrap_or_else(|_| "sqlite://rillflow.db".to_string());
        Self::connect(&url).await
    }

    async fn live_lease(&self, execution_id: &str) -> Result<Option<(String, String)>, StorageError> {
        sqlx::query("DELETE FROM leases WHERE execution_id = ?1 AND expires_at <= ?2")
            .bind(execution_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        let row = sqlx::query("SELECT owner, token FROM leases WHERE execution_id = ?1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row
            .map(|r| -> Result<_, sqlx::Error> { Ok((r.try_get("owner")?, r.try_get("token")?)) })
            .transpose()
            .map_err(backend)?)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self, blob), err)]
    async fn put_snapshot(
        &self,
        execution_id: &str,
        version: u64,
        blob: Vec<u8>,
    ) -> Result<(), StorageError> {
        let summary = super::summarize_blob(execution_id, version, &blob)?;
        let result = sqlx::query(
            "INSERT INTO snapshots (execution_id, version, flow_id, status, created_at, updated_at, blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(execution_id)
        .bind(version as i64)
        .bind(&summary.flow_id)
        .bind(status_str(summary.status))
        .bind(summary.created_at.to_rfc3339())
        .bind(summary.updated_at.to_rfc3339())
        .bind(&blob)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::SnapshotExists {
                    execution_id: execution_id.to_string(),
                    version,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn latest_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        let row = sqlx::query(
            "SELECT version, blob FROM snapshots WHERE execution_id = ?1
             ORDER BY version DESC LIMIT 1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| -> Result<_, sqlx::Error> {
            Ok((r.try_get::<i64, _>("version")? as u64, r.try_get("blob")?))
        })
        .transpose()
        .map_err(backend)
    }

    async fn read_snapshots(
        &self,
        execution_id: &str,
    ) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        let rows = sqlx::query(
            "SELECT version, blob FROM snapshots WHERE execution_id = ?1 ORDER BY version ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|r| -> Result<_, sqlx::Error> {
                Ok((r.try_get::<i64, _>("version")? as u64, r.try_get("blob")?))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)
    }

    async fn append_event(&self, record: EventRecord) -> Result<(), StorageError> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM events WHERE execution_id = ?1",
        )
        .bind(&record.execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        if record.seq != next as u64 {
            return Err(StorageError::EventGap {
                execution_id: record.execution_id,
                expected: next as u64,
                got: record.seq,
            });
        }
        let payload = serde_json::to_string(&record)?;
        sqlx::query("INSERT INTO events (execution_id, seq, at, payload) VALUES (?1, ?2, ?3, ?4)")
            .bind(&record.execution_id)
            .bind(record.seq as i64)
            .bind(record.at.to_rfc3339())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn read_events(
        &self,
        execution_id: &str,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT payload FROM events WHERE execution_id = ?1 AND seq >= ?2 ORDER BY seq ASC",
        )
        .bind(execution_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|r| {
                let payload: String = r.try_get("payload").map_err(backend)?;
                serde_json::from_str(&payload).map_err(Into::into)
            })
            .collect()
    }

    async fn put_task_result(
        &self,
        execution_id: &str,
        record: TaskResultRecord,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&record)?;
        sqlx::query(
            "INSERT OR REPLACE INTO task_results (execution_id, node_id, attempt, payload)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(execution_id)
        .bind(&record.node_id)
        .bind(record.attempt as i64)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn task_result(
        &self,
        execution_id: &str,
        node_id: &str,
        attempt: u32,
    ) -> Result<Option<TaskResultRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT payload FROM task_results
             WHERE execution_id = ?1 AND node_id = ?2 AND attempt = ?3",
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(attempt as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| {
            let payload: String = r.try_get("payload").map_err(backend)?;
            serde_json::from_str(&payload).map_err(Into::into)
        })
        .transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: &Page,
    ) -> Result<ExecutionPage, StorageError> {
        // Empty bind means "no filter"; keeps the parameter count fixed.
        let where_clause = "(?1 = '' OR s.flow_id = ?1)
               AND (?2 = '' OR s.status = ?2)
               AND (?3 = '' OR s.created_at >= ?3)
               AND (?4 = '' OR s.created_at <= ?4)";
        let base = format!(
            "FROM snapshots s
             JOIN (SELECT execution_id, MAX(version) AS latest FROM snapshots GROUP BY execution_id) m
               ON s.execution_id = m.execution_id AND s.version = m.latest
             WHERE {where_clause}"
        );

        let flow_bind = filter.flow_id.clone().unwrap_or_default();
        let status_bind = filter.status.map(status_str).unwrap_or_default();
        let after_bind = filter
            .created_after
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let before_bind = filter
            .created_before
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        let total_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {base}"))
            .bind(&flow_bind)
            .bind(&status_bind)
            .bind(&after_bind)
            .bind(&before_bind)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        let rows = sqlx::query(&format!(
            "SELECT s.execution_id, s.flow_id, s.status, s.created_at, s.updated_at, s.version
             {base}
             ORDER BY s.created_at ASC, s.execution_id ASC
             LIMIT ?5 OFFSET ?6"
        ))
        .bind(&flow_bind)
        .bind(&status_bind)
        .bind(&after_bind)
        .bind(&before_bind)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(backend)?;
            let created_at: String = row.try_get("created_at").map_err(backend)?;
            let updated_at: String = row.try_get("updated_at").map_err(backend)?;
            executions.push(ExecutionSummary {
                execution_id: row.try_get("execution_id").map_err(backend)?,
                flow_id: row.try_get("flow_id").map_err(backend)?,
                status: status_from_str(&status)?,
                latest_version: row.try_get::<i64, _>("version").map_err(backend)? as u64,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        let fetched = page.offset as u64 + executions.len() as u64;
        Ok(ExecutionPage {
            page_info: PageInfo {
                total_count: total_count as u64,
                page_size: executions.len() as u32,
                offset: page.offset,
                has_next_page: fetched < total_count as u64,
            },
            executions,
        })
    }

    #[instrument(skip(self), err)]
    async fn delete_execution(&self, execution_id: &str) -> Result<(), StorageError> {
        if let Some((owner, _token)) = self.live_lease(execution_id).await? {
            return Err(StorageError::LeaseHeld {
                execution_id: execution_id.to_string(),
                owner,
            });
        }
        for table in ["snapshots", "events", "task_results", "leases"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE execution_id = ?1"))
                .bind(execution_id)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        execution_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StorageError> {
        if let Some((held_owner, _)) = self.live_lease(execution_id).await? {
            return Err(StorageError::LeaseHeld {
                execution_id: execution_id.to_string(),
                owner: held_owner,
            });
        }
        let lease = Lease {
            execution_id: execution_id.to_string(),
            owner: owner.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
        };
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO leases (execution_id, owner, token, ttl_ms, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(execution_id)
        .bind(owner)
        .bind(&lease.token)
        .bind(ttl.as_millis() as i64)
        .bind(lease.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if inserted.rows_affected() == 0 {
            // Another owner slipped in between the check and the insert.
            let owner = self
                .live_lease(execution_id)
                .await?
                .map(|(owner, _)| owner)
                .unwrap_or_default();
            return Err(StorageError::LeaseHeld {
                execution_id: execution_id.to_string(),
                owner,
            });
        }
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, StorageError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lease.ttl).unwrap_or(chrono::Duration::seconds(30));
        let updated = sqlx::query(
            "UPDATE leases SET expires_at = ?1 WHERE execution_id = ?2 AND token = ?3",
        )
        .bind(expires_at.to_rfc3339())
        .bind(&lease.execution_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::LeaseLost {
                execution_id: lease.execution_id.clone(),
            });
        }
        let mut renewed = lease.clone();
        renewed.expires_at = expires_at;
        Ok(renewed)
    }

    async fn release_lease(&self, lease: Lease) -> Result<(), StorageError> {
        let deleted = sqlx::query("DELETE FROM leases WHERE execution_id = ?1 AND token = ?2")
            .bind(&lease.execution_id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if deleted.rows_affected() == 0 {
            return Err(StorageError::LeaseLost {
                execution_id: lease.execution_id,
            });
        }
        Ok(())
    }
}
