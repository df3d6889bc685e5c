use super::{
    check_action_transition, check_run_transition, error::Result, error::StorageError,
    starts_action, Cas, StateStore, TransitionMetadata,
};
use crate::core::{
    ActionRecord, ActionStatus, CoreError, RollbackFailure, Run, RunState, RunStatus,
};
use crate::graph::ActionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default pool size for SQLite connection pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

const ACTION_COLUMNS: &str = "action_id, action_type, status, attempts, last_error, output, \
                              claim, started_at, finished_at, updated_at";

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            max_lifetime: None,
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// SQLite-backed state store.
///
/// Runs, actions and rollback failures live in three tables. Conditional
/// writes are single `UPDATE ... WHERE status = ?` statements; a write that
/// matched no row lost the race and is reported as a conflict.
pub struct SqliteStateStore {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteStateStore {
    /// Opens (or creates) a database file with the default pool configuration.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, PoolConfig::default()).await
    }

    pub async fn with_config(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path_str))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = Self::build_pool(connect_options, &config).await?;
        let store = Self {
            pool,
            db_path: db_path_str,
        };
        store.initialize().await?;

        info!(db_path = %store.db_path, "opened sqlite state store");
        Ok(store)
    }

    /// In-memory database on a single pooled connection that never expires,
    /// so the data lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let config = PoolConfig {
            max_size: 1,
            min_idle: Some(1),
            idle_timeout: None,
            max_lifetime: None,
            ..PoolConfig::default()
        };

        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Memory)
            .synchronous(SqliteSynchronous::Normal);

        let pool = Self::build_pool(connect_options, &config).await?;
        let store = Self {
            pool,
            db_path: ":memory:".to_string(),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn build_pool(
        connect_options: SqliteConnectOptions,
        config: &PoolConfig,
    ) -> Result<Pool<Sqlite>> {
        let mut builder = SqlitePoolOptions::new()
            .max_connections(config.max_size)
            .acquire_timeout(config.connection_timeout)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout);

        if let Some(min_idle) = config.min_idle {
            builder = builder.min_connections(min_idle);
        }

        builder
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                plan_ref TEXT NOT NULL,
                plan_hash INTEGER NOT NULL,
                status TEXT CHECK( status IN ('PENDING','RUNNING','SUCCEEDED','FAILED','CANCELLED','ROLLING_BACK','ROLLED_BACK') ) NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS actions (
                run_id TEXT NOT NULL,
                action_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                status TEXT CHECK( status IN ('PENDING','READY','RUNNING','COMPLETE','FAILED','SKIPPED','ROLLING_BACK','ROLLED_BACK') ) NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                output TEXT,
                claim TEXT,
                started_at INTEGER,
                finished_at INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, action_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rollback_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                action_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rollback_failures_run ON rollback_failures(run_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn row_to_run(row: &SqliteRow) -> Result<Run> {
        let run_id: String = row.try_get("run_id")?;
        let status: String = row.try_get("status")?;
        let plan_hash: i64 = row.try_get("plan_hash")?;

        Ok(Run {
            run_id: parse_uuid(&run_id)?,
            plan_ref: row.try_get("plan_ref")?,
            plan_hash: plan_hash as u64,
            status: RunStatus::from_str(&status)?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn row_to_action(row: &SqliteRow) -> Result<ActionRecord> {
        let status: String = row.try_get("status")?;
        let attempts: i64 = row.try_get("attempts")?;
        let output: Option<String> = row.try_get("output")?;
        let claim: Option<String> = row.try_get("claim")?;
        let started_at: Option<i64> = row.try_get("started_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;

        Ok(ActionRecord {
            id: ActionId::new(row.try_get::<String, _>("action_id")?),
            action_type: row.try_get("action_type")?,
            status: ActionStatus::from_str(&status)?,
            attempts: u32::try_from(attempts)
                .map_err(|_| StorageError::Corrupt(format!("attempts out of range: {}", attempts)))?,
            last_error: row.try_get("last_error")?,
            output: output
                .map(|json| serde_json::from_str(&json).map_err(CoreError::Deserialization))
                .transpose()?,
            claim: claim.as_deref().map(parse_uuid).transpose()?,
            started_at: started_at.map(from_millis).transpose()?,
            finished_at: finished_at.map(from_millis).transpose()?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    async fn fetch_action(
        conn: &mut SqliteConnection,
        run_id: Uuid,
        action_id: &ActionId,
    ) -> Result<Option<ActionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM actions WHERE run_id = ? AND action_id = ?",
            ACTION_COLUMNS
        ))
        .bind(run_id.to_string())
        .bind(action_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| Self::row_to_action(&r)).transpose()
    }

    async fn fetch_run(conn: &mut SqliteConnection, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT run_id, plan_ref, plan_hash, status, created_at, updated_at
             FROM runs WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| Self::row_to_run(&r)).transpose()
    }

    async fn insert_action(
        conn: &mut SqliteConnection,
        run_id: Uuid,
        record: &ActionRecord,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO actions (run_id, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ACTION_COLUMNS
        ))
        .bind(run_id.to_string())
        .bind(record.id.as_str())
        .bind(&record.action_type)
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(&record.last_error)
        .bind(encode_output(record)?)
        .bind(record.claim.map(|c| c.to_string()))
        .bind(record.started_at.map(|t| t.timestamp_millis()))
        .bind(record.finished_at.map(|t| t.timestamp_millis()))
        .bind(record.updated_at.timestamp_millis())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Writes every table for `state` inside an open transaction.
    async fn write_state(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        run_id: Uuid,
        state: &RunState,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO runs (run_id, plan_ref, plan_hash, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(&state.run.plan_ref)
        .bind(state.run.plan_hash as i64)
        .bind(state.run.status.as_str())
        .bind(state.run.created_at.timestamp_millis())
        .bind(state.run.updated_at.timestamp_millis())
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM actions WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&mut **tx)
            .await?;
        for record in state.actions.values() {
            Self::insert_action(&mut **tx, run_id, record).await?;
        }

        sqlx::query("DELETE FROM rollback_failures WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&mut **tx)
            .await?;
        for failure in &state.rollback_failures {
            Self::insert_failure(&mut **tx, run_id, failure).await?;
        }

        Ok(())
    }

    async fn insert_failure(
        conn: &mut SqliteConnection,
        run_id: Uuid,
        failure: &RollbackFailure,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO rollback_failures (run_id, action_id, reason, recorded_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(failure.action_id.as_str())
        .bind(&failure.reason)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>> {
        let mut conn = self.pool.acquire().await?;
        let Some(run) = Self::fetch_run(&mut conn, run_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            "SELECT {} FROM actions WHERE run_id = ? ORDER BY action_id",
            ACTION_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

        let mut actions = BTreeMap::new();
        for row in &rows {
            let record = Self::row_to_action(row)?;
            actions.insert(record.id.clone(), record);
        }

        let rollback_failures = sqlx::query(
            "SELECT action_id, reason FROM rollback_failures WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id.to_string())
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| -> Result<RollbackFailure> {
            Ok(RollbackFailure {
                action_id: ActionId::new(row.try_get::<String, _>("action_id")?),
                reason: row.try_get("reason")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(RunState {
            run,
            actions,
            rollback_failures,
        }))
    }

    async fn put(&self, run_id: Uuid, state: &RunState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_state(&mut tx, run_id, state).await?;
        tx.commit().await?;

        debug!(%run_id, status = %state.run.status, "stored run snapshot");
        Ok(())
    }

    async fn create(&self, state: &RunState) -> Result<Cas<RunState>> {
        let run_id = state.run.run_id;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO runs (run_id, plan_ref, plan_hash, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(&state.run.plan_ref)
        .bind(state.run.plan_hash as i64)
        .bind(state.run.status.as_str())
        .bind(state.run.created_at.timestamp_millis())
        .bind(state.run.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            let existing = self.get(run_id).await?.ok_or(StorageError::RunNotFound(run_id))?;
            return Ok(Cas::Conflict(existing));
        }

        for record in state.actions.values() {
            Self::insert_action(&mut *tx, run_id, record).await?;
        }
        for failure in &state.rollback_failures {
            Self::insert_failure(&mut *tx, run_id, failure).await?;
        }
        tx.commit().await?;

        Ok(Cas::Applied(state.clone()))
    }

    async fn conditional_set(
        &self,
        run_id: Uuid,
        action_id: &ActionId,
        expected: ActionStatus,
        next: ActionStatus,
        metadata: TransitionMetadata,
    ) -> Result<Cas<ActionRecord>> {
        check_action_transition(expected, next)?;

        let mut tx = self.pool.begin().await?;

        let current = match Self::fetch_action(&mut *tx, run_id, action_id).await? {
            Some(record) => record,
            None => {
                let run_exists = Self::fetch_run(&mut *tx, run_id).await?.is_some();
                tx.rollback().await?;
                if !run_exists {
                    return Err(StorageError::RunNotFound(run_id));
                }
                return Err(StorageError::ActionNotFound {
                    run_id,
                    action_id: action_id.clone(),
                });
            }
        };

        if current.status != expected || !metadata.claim_matches(&current) {
            tx.rollback().await?;
            return Ok(Cas::Conflict(current));
        }

        let held_claim = current.claim.map(|c| c.to_string());
        let starting = starts_action(current.status, next);
        let mut updated = current.clone();
        metadata.apply(&mut updated, next, Utc::now());

        // the WHERE clause repeats the checks so a concurrent writer between
        // the read and this statement makes it match nothing
        let mut sql = String::from(
            "UPDATE actions
             SET status = ?, attempts = ?, last_error = ?, output = ?, claim = ?,
                 started_at = ?, finished_at = ?, updated_at = ?
             WHERE run_id = ? AND action_id = ? AND status = ? AND claim IS ?",
        );
        if starting {
            sql.push_str(" AND EXISTS (SELECT 1 FROM runs WHERE run_id = ? AND status = 'RUNNING')");
        }

        let mut query = sqlx::query(&sql)
            .bind(updated.status.as_str())
            .bind(i64::from(updated.attempts))
            .bind(updated.last_error.clone())
            .bind(encode_output(&updated)?)
            .bind(updated.claim.map(|c| c.to_string()))
            .bind(updated.started_at.map(|t| t.timestamp_millis()))
            .bind(updated.finished_at.map(|t| t.timestamp_millis()))
            .bind(updated.updated_at.timestamp_millis())
            .bind(run_id.to_string())
            .bind(action_id.as_str())
            .bind(expected.as_str())
            .bind(held_claim);
        if starting {
            query = query.bind(run_id.to_string());
        }

        let result = query.execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            let latest = Self::fetch_action(&mut *tx, run_id, action_id)
                .await?
                .unwrap_or(current);
            tx.rollback().await?;
            return Ok(Cas::Conflict(latest));
        }

        tx.commit().await?;
        Ok(Cas::Applied(updated))
    }

    async fn conditional_set_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Cas<Run>> {
        check_run_transition(expected, next)?;

        let result = sqlx::query("UPDATE runs SET status = ?, updated_at = ? WHERE run_id = ? AND status = ?")
            .bind(next.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(run_id.to_string())
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        let mut conn = self.pool.acquire().await?;
        let run = Self::fetch_run(&mut conn, run_id)
            .await?
            .ok_or(StorageError::RunNotFound(run_id))?;

        if result.rows_affected() == 0 {
            Ok(Cas::Conflict(run))
        } else {
            Ok(Cas::Applied(run))
        }
    }

    async fn record_rollback_failure(&self, run_id: Uuid, failure: RollbackFailure) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if Self::fetch_run(&mut *tx, run_id).await?.is_none() {
            return Err(StorageError::RunNotFound(run_id));
        }
        sqlx::query("DELETE FROM rollback_failures WHERE run_id = ? AND action_id = ?")
            .bind(run_id.to_string())
            .bind(failure.action_id.as_str())
            .execute(&mut *tx)
            .await?;
        Self::insert_failure(&mut *tx, run_id, &failure).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn encode_output(record: &ActionRecord) -> Result<Option<String>> {
    record
        .output
        .as_ref()
        .map(|value| {
            serde_json::to_string(value)
                .map_err(|e| StorageError::from(CoreError::Serialization(e)))
        })
        .transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("bad uuid '{}': {}", s, e)))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", millis)))
}
