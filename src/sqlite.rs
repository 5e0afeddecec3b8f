//! `SQLite`-backed persistence for idempotency records.
//!
//! Records live in one table keyed by the full `prefix:suffix` string. The
//! response column holds the JSON-encoded [`CachedResponse`]; timestamps are
//! Unix milliseconds.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::{IdempotencyError, Result};
use crate::key::IdempotencyKey;
use crate::response::CachedResponse;
use crate::store::{IdempotencyRecord, InsertOutcome, ResponseStore};

const BACKEND: &str = "sqlite";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY NOT NULL,
    response TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at
    ON idempotency_keys (expires_at);
";

/// Shared handle to one `SQLite` connection.
///
/// Work is executed on the blocking pool; callers never hold the lock across
/// an await point.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Opens (or creates) a database file in WAL mode.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened sqlite database");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| IdempotencyError::storage(BACKEND, "connection lock poisoned"))?;
        guard.execute_batch(sql)?;
        Ok(())
    }

    /// Runs `f` against the connection on the blocking thread pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| IdempotencyError::storage(BACKEND, "connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| IdempotencyError::storage(BACKEND, format!("blocking task failed: {err}")))?
    }
}

/// Relational [`ResponseStore`] over the `idempotency_keys` table.
#[derive(Clone)]
pub struct SqliteResponseStore {
    db: SqliteDatabase,
}

impl SqliteResponseStore {
    /// Wraps `db`, creating the table and index when missing.
    pub fn new(db: SqliteDatabase) -> Result<Self> {
        db.execute_batch(SCHEMA_SQL)?;
        Ok(Self { db })
    }

    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        Self::new(SqliteDatabase::open(path, busy_timeout)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(SqliteDatabase::open_in_memory()?)
    }

    pub fn database(&self) -> &SqliteDatabase {
        &self.db
    }
}

#[async_trait]
impl ResponseStore for SqliteResponseStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let key = key.clone();
        self.db.run(move |conn| select_record(conn, &key)).await
    }

    async fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome> {
        let response = serde_json::to_string(&record.response)?;
        self.db
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let written = tx.execute(
                    "INSERT INTO idempotency_keys (key, response, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key) DO UPDATE SET
                         response = excluded.response,
                         created_at = excluded.created_at,
                         expires_at = excluded.expires_at
                     WHERE idempotency_keys.expires_at <= excluded.created_at",
                    params![
                        record.key.as_str(),
                        response,
                        record.created_at.timestamp_millis(),
                        record.expires_at.timestamp_millis(),
                    ],
                )?;
                let outcome = if written == 1 {
                    InsertOutcome::Inserted
                } else {
                    let existing = select_record(&tx, &record.key)?.ok_or_else(|| {
                        IdempotencyError::storage(BACKEND, "conflicting row vanished mid-transaction")
                    })?;
                    InsertOutcome::Existing(existing)
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.db
            .run(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
                    params![now.timestamp_millis()],
                )?;
                Ok(removed as u64)
            })
            .await
    }
}

fn select_record(conn: &Connection, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
    let row = conn
        .query_row(
            "SELECT response, created_at, expires_at FROM idempotency_keys WHERE key = ?1",
            params![key.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((response, created_at, expires_at)) = row else {
        return Ok(None);
    };
    let response: CachedResponse = serde_json::from_str(&response)?;
    Ok(Some(IdempotencyRecord {
        key: key.clone(),
        response,
        created_at: from_millis(created_at)?,
        expires_at: from_millis(expires_at)?,
    }))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| IdempotencyError::storage(BACKEND, format!("timestamp {ms} out of range")))
}
