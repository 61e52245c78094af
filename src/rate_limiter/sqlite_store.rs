// src/rate_limiter/sqlite_store.rs
//! SQLite-backed [`StateStore`].
//!
//! `rate_limit_state` holds a single row (id = 1) that is upserted in place;
//! `request_metrics` is append-only. Timestamps are stored as epoch
//! milliseconds. The database runs in WAL mode with `synchronous = FULL` so a
//! write is on disk before the call returns.

use super::circuit_breaker::CircuitSnapshot;
use super::state_store::StateStore;
use super::types::{RateLimitState, RequestMetric};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const STATE_ROW_ID: i64 = 1;

const CREATE_STATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limit_state (
    id INTEGER PRIMARY KEY,
    remaining INTEGER,
    reset_timestamp INTEGER,
    retry_after INTEGER,
    last_updated INTEGER NOT NULL DEFAULT 0,
    etag_cache TEXT NOT NULL DEFAULT '{}',
    last_modified_cache TEXT NOT NULL DEFAULT '{}',
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    circuit_opened_at INTEGER
)";

const CREATE_METRICS_TABLE: &str = "CREATE TABLE IF NOT EXISTS request_metrics (
    timestamp INTEGER NOT NULL,
    endpoint TEXT NOT NULL,
    status_code INTEGER,
    response_time REAL NOT NULL,
    rate_limited INTEGER NOT NULL
)";

const CREATE_METRICS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_request_metrics_timestamp ON request_metrics (timestamp)";

pub struct SqliteStateStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStateStore {
    /// Opens (creating if needed) the database at `path` and its parent directory
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        // One connection: the limiter is the only writer
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool, path };
        store.migrate().await?;
        info!("💾 Rate limiter state database ready at {}", store.path.display());
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in [CREATE_STATE_TABLE, CREATE_METRICS_TABLE, CREATE_METRICS_INDEX] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn metric_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM request_metrics")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", millis)))
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self) -> Result<RateLimitState, StoreError> {
        let row = sqlx::query(
            "SELECT remaining, reset_timestamp, retry_after, last_updated, etag_cache, last_modified_cache
             FROM rate_limit_state WHERE id = ?",
        )
        .bind(STATE_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            debug!("No stored rate limit state, starting unconstrained");
            return Ok(RateLimitState::default());
        };

        let remaining: Option<i64> = row.try_get("remaining")?;
        let reset_timestamp: Option<i64> = row.try_get("reset_timestamp")?;
        let retry_after: Option<i64> = row.try_get("retry_after")?;
        let last_updated: i64 = row.try_get("last_updated")?;
        let etag_cache: String = row.try_get("etag_cache")?;
        let last_modified_cache: String = row.try_get("last_modified_cache")?;

        Ok(RateLimitState {
            remaining_quota: remaining.map(from_sql_int),
            reset_timestamp: reset_timestamp.map(from_millis).transpose()?,
            retry_after: retry_after.map(from_sql_int),
            last_updated: from_millis(last_updated)?,
            etags: serde_json::from_str::<BTreeMap<String, String>>(&etag_cache)?,
            last_modified: serde_json::from_str::<BTreeMap<String, String>>(&last_modified_cache)?,
        })
    }

    async fn save(&self, state: &RateLimitState) -> Result<(), StoreError> {
        let etag_cache = serde_json::to_string(&state.etags)?;
        let last_modified_cache = serde_json::to_string(&state.last_modified)?;

        sqlx::query(
            "INSERT INTO rate_limit_state
                (id, remaining, reset_timestamp, retry_after, last_updated, etag_cache, last_modified_cache)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                remaining = excluded.remaining,
                reset_timestamp = excluded.reset_timestamp,
                retry_after = excluded.retry_after,
                last_updated = excluded.last_updated,
                etag_cache = excluded.etag_cache,
                last_modified_cache = excluded.last_modified_cache",
        )
        .bind(STATE_ROW_ID)
        .bind(state.remaining_quota.map(to_sql_int))
        .bind(state.reset_timestamp.map(to_millis))
        .bind(state.retry_after.map(to_sql_int))
        .bind(to_millis(state.last_updated))
        .bind(etag_cache)
        .bind(last_modified_cache)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_circuit(&self) -> Result<CircuitSnapshot, StoreError> {
        let row = sqlx::query(
            "SELECT consecutive_failures, circuit_opened_at FROM rate_limit_state WHERE id = ?",
        )
        .bind(STATE_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(CircuitSnapshot::default());
        };

        let consecutive_failures: i64 = row.try_get("consecutive_failures")?;
        let opened_at: Option<i64> = row.try_get("circuit_opened_at")?;
        Ok(CircuitSnapshot {
            consecutive_failures: u32::try_from(consecutive_failures.max(0)).unwrap_or(u32::MAX),
            opened_at: opened_at.map(from_millis).transpose()?,
        })
    }

    async fn save_circuit(&self, snapshot: &CircuitSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rate_limit_state (id, consecutive_failures, circuit_opened_at)
             VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                circuit_opened_at = excluded.circuit_opened_at",
        )
        .bind(STATE_ROW_ID)
        .bind(i64::from(snapshot.consecutive_failures))
        .bind(snapshot.opened_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // One upsert of the whole row, a single implicit transaction and one
    // synchronous commit per attempt
    async fn save_snapshot(
        &self,
        state: &RateLimitState,
        circuit: &CircuitSnapshot,
    ) -> Result<(), StoreError> {
        let etag_cache = serde_json::to_string(&state.etags)?;
        let last_modified_cache = serde_json::to_string(&state.last_modified)?;

        sqlx::query(
            "INSERT INTO rate_limit_state
                (id, remaining, reset_timestamp, retry_after, last_updated, etag_cache,
                 last_modified_cache, consecutive_failures, circuit_opened_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                remaining = excluded.remaining,
                reset_timestamp = excluded.reset_timestamp,
                retry_after = excluded.retry_after,
                last_updated = excluded.last_updated,
                etag_cache = excluded.etag_cache,
                last_modified_cache = excluded.last_modified_cache,
                consecutive_failures = excluded.consecutive_failures,
                circuit_opened_at = excluded.circuit_opened_at",
        )
        .bind(STATE_ROW_ID)
        .bind(state.remaining_quota.map(to_sql_int))
        .bind(state.reset_timestamp.map(to_millis))
        .bind(state.retry_after.map(to_sql_int))
        .bind(to_millis(state.last_updated))
        .bind(etag_cache)
        .bind(last_modified_cache)
        .bind(i64::from(circuit.consecutive_failures))
        .bind(circuit.opened_at.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_metric(&self, metric: &RequestMetric) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO request_metrics (timestamp, endpoint, status_code, response_time, rate_limited)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(to_millis(metric.timestamp))
        .bind(&metric.endpoint)
        .bind(metric.status_code.map(i64::from))
        .bind(metric.response_time.as_secs_f64())
        .bind(metric.was_rate_limited)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
