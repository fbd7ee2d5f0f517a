// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable local state (SQLite via sqlx `Any`).
//!
//! Two tables:
//! ```sql
//! CREATE TABLE kv_state (
//!   key   TEXT PRIMARY KEY,
//!   value TEXT NOT NULL          -- e.g. backend_mode_hint = "local-origin"
//! )
//! CREATE TABLE mutation_queue (
//!   seq        INTEGER PRIMARY KEY AUTOINCREMENT,  -- FIFO order
//!   id         TEXT NOT NULL UNIQUE,
//!   entity     TEXT NOT NULL,
//!   operation  TEXT NOT NULL,
//!   record_id  TEXT,             -- JSON RecordId (update/delete)
//!   payload    TEXT,             -- JSON body (create/update)
//!   attempts   INTEGER NOT NULL,
//!   queued_at  TEXT NOT NULL,
//!   state      TEXT NOT NULL,    -- queued | permanently_failed
//!   last_error TEXT
//! )
//! ```
//!
//! Without a path the database lives in memory on a single pooled
//! connection, which keeps it alive for the store's lifetime.

use std::sync::Once;
use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::info;

use crate::error::ClientError;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn storage_err(context: &str) -> impl Fn(sqlx::Error) -> ClientError + '_ {
    move |e| ClientError::Storage(format!("{}: {}", context, e))
}

/// One persisted queue row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueueRow {
    pub seq: i64,
    pub id: String,
    pub entity: String,
    pub operation: String,
    pub record_id: Option<String>,
    pub payload: Option<String>,
    pub attempts: i64,
    pub queued_at: String,
    pub state: String,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct LocalStore {
    pool: AnyPool,
}

impl LocalStore {
    /// Open (creating if needed) the state database at `path`, or an
    /// in-memory one when `path` is `None`.
    pub async fn open(path: Option<&str>) -> Result<Self, ClientError> {
        install_drivers();

        let url = match path {
            Some(path) => format!("sqlite://{}?mode=rwc", path),
            None => "sqlite::memory:".to_string(),
        };
        info!(path = path.unwrap_or(":memory:"), "Opening local state store");

        let pool = retry("state_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(None)
                .max_lifetime(None)
                .test_before_acquire(false)
                .connect(&url)
                .await
                .map_err(storage_err("connect"))
        })
        .await?;

        let store = Self { pool };
        if path.is_some() {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&store.pool)
                .await
                .map_err(storage_err("enable WAL mode"))?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("create kv_state"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity TEXT NOT NULL,
                operation TEXT NOT NULL,
                record_id TEXT,
                payload TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                queued_at TEXT NOT NULL,
                state TEXT NOT NULL,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("create mutation_queue"))?;

        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>, ClientError> {
        let row = sqlx::query("SELECT value FROM kv_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("read kv_state"))?;
        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(storage_err("decode kv_state"))
    }

    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), ClientError> {
        sqlx::query(
            "INSERT INTO kv_state (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(storage_err("write kv_state"))?;
        Ok(())
    }

    /// Append a row; returns its FIFO sequence number.
    pub(crate) async fn push_mutation(&self, row: &QueueRow) -> Result<i64, ClientError> {
        sqlx::query(
            "INSERT INTO mutation_queue \
             (id, entity, operation, record_id, payload, attempts, queued_at, state, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.entity)
        .bind(&row.operation)
        .bind(row.record_id.clone())
        .bind(row.payload.clone())
        .bind(row.attempts)
        .bind(&row.queued_at)
        .bind(&row.state)
        .bind(row.last_error.clone())
        .execute(&self.pool)
        .await
        .map_err(storage_err("enqueue mutation"))?;

        let seq: i64 = sqlx::query("SELECT seq FROM mutation_queue WHERE id = ?")
            .bind(&row.id)
            .fetch_one(&self.pool)
            .await
            .and_then(|r| r.try_get("seq"))
            .map_err(storage_err("read sequence"))?;
        Ok(seq)
    }

    /// Rows in `state`, oldest first. `limit` caps the result.
    pub(crate) async fn mutations_in_state(&self, state: &str, limit: Option<i64>) -> Result<Vec<QueueRow>, ClientError> {
        let rows = sqlx::query(
            "SELECT seq, id, entity, operation, record_id, payload, attempts, queued_at, state, last_error \
             FROM mutation_queue WHERE state = ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(state)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("read mutation_queue"))?;

        rows.iter()
            .map(|row| {
                Ok(QueueRow {
                    seq: row.try_get("seq")?,
                    id: row.try_get("id")?,
                    entity: row.try_get("entity")?,
                    operation: row.try_get("operation")?,
                    record_id: row.try_get("record_id")?,
                    payload: row.try_get("payload")?,
                    attempts: row.try_get("attempts")?,
                    queued_at: row.try_get("queued_at")?,
                    state: row.try_get("state")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(storage_err("decode mutation_queue"))
    }

    pub(crate) async fn update_mutation(
        &self,
        id: &str,
        attempts: i64,
        state: &str,
        last_error: Option<&str>,
    ) -> Result<(), ClientError> {
        sqlx::query("UPDATE mutation_queue SET attempts = ?, state = ?, last_error = ? WHERE id = ?")
            .bind(attempts)
            .bind(state)
            .bind(last_error.map(str::to_string))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err("update mutation"))?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub(crate) async fn delete_mutation(&self, id: &str) -> Result<bool, ClientError> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err("delete mutation"))?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn count_mutations(&self, state: &str) -> Result<u64, ClientError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM mutation_queue WHERE state = ?")
            .bind(state)
            .fetch_one(&self.pool)
            .await
            .and_then(|r| r.try_get("n"))
            .map_err(storage_err("count mutations"))?;
        Ok(count.max(0) as u64)
    }
}
