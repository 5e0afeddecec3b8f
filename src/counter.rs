//! Live connection counts per tenant project.
//!
//! Counts go through an injected [`ConnectionCounter`] so that several
//! service instances can share them through the database instead of keeping
//! process-local tallies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use crate::error::{IdempotencyError, Result};
use crate::sqlite::SqliteDatabase;

/// Builds the counter scope for a tenant's project.
pub fn project_scope(tenant_id: &str, project_id: &str) -> String {
    format!("{tenant_id}/{project_id}")
}

#[async_trait]
pub trait ConnectionCounter: Send + Sync {
    /// Adds one connection, returning the new count.
    async fn increment(&self, scope: &str) -> Result<u64>;

    /// Removes one connection, never going below zero. Returns the new count.
    async fn decrement(&self, scope: &str) -> Result<u64>;

    async fn reset(&self, scope: &str) -> Result<()>;

    async fn get(&self, scope: &str) -> Result<u64>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryConnectionCounter {
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl InMemoryConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, u64>>> {
        self.counts
            .lock()
            .map_err(|_| IdempotencyError::storage("memory", "counter map lock poisoned"))
    }
}

#[async_trait]
impl ConnectionCounter for InMemoryConnectionCounter {
    async fn increment(&self, scope: &str) -> Result<u64> {
        let mut guard = self.lock()?;
        let count = guard.entry(scope.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn decrement(&self, scope: &str) -> Result<u64> {
        let mut guard = self.lock()?;
        match guard.get_mut(scope) {
            Some(count) => {
                *count = count.saturating_sub(1);
                Ok(*count)
            }
            None => Ok(0),
        }
    }

    async fn reset(&self, scope: &str) -> Result<()> {
        self.lock()?.remove(scope);
        Ok(())
    }

    async fn get(&self, scope: &str) -> Result<u64> {
        Ok(self.lock()?.get(scope).copied().unwrap_or(0))
    }
}

const COUNTER_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS connection_counts (
    scope TEXT PRIMARY KEY NOT NULL,
    count INTEGER NOT NULL CHECK (count >= 0),
    updated_at INTEGER NOT NULL
);
";

/// Counter shared through the `connection_counts` table.
/// Every operation is a single atomic statement.
#[derive(Clone)]
pub struct SqliteConnectionCounter {
    db: SqliteDatabase,
}

impl SqliteConnectionCounter {
    pub fn new(db: SqliteDatabase) -> Result<Self> {
        db.execute_batch(COUNTER_SCHEMA_SQL)?;
        Ok(Self { db })
    }
}

#[async_trait]
impl ConnectionCounter for SqliteConnectionCounter {
    async fn increment(&self, scope: &str) -> Result<u64> {
        let scope = scope.to_string();
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    "INSERT INTO connection_counts (scope, count, updated_at) VALUES (?1, 1, ?2)
                     ON CONFLICT(scope) DO UPDATE SET
                         count = connection_counts.count + 1,
                         updated_at = excluded.updated_at
                     RETURNING count",
                    params![scope, Utc::now().timestamp_millis()],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn decrement(&self, scope: &str) -> Result<u64> {
        let scope = scope.to_string();
        self.db
            .run(move |conn| {
                let count: Option<i64> = conn
                    .query_row(
                        "UPDATE connection_counts
                         SET count = MAX(count - 1, 0), updated_at = ?2
                         WHERE scope = ?1
                         RETURNING count",
                        params![scope, Utc::now().timestamp_millis()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(count.unwrap_or(0) as u64)
            })
            .await
    }

    async fn reset(&self, scope: &str) -> Result<()> {
        let scope = scope.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM connection_counts WHERE scope = ?1",
                    params![scope],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, scope: &str) -> Result<u64> {
        let scope = scope.to_string();
        self.db
            .run(move |conn| {
                let count: Option<i64> = conn
                    .query_row(
                        "SELECT count FROM connection_counts WHERE scope = ?1",
                        params![scope],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(count.unwrap_or(0) as u64)
            })
            .await
    }
}
