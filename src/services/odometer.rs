//! Durable replication counters.
//!
//! A single SQLite row holds the object count, the bytes currently stored,
//! and the cumulative bytes uploaded and downloaded. Every adjustment is
//! persisted before it becomes visible in memory, under one lock.

use crate::errors::ReplicaResult;
use crate::models::odometer::{OdometerDelta, OdometerReading};
use chrono::Utc;
use sqlx::{SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct Odometer {
    db: Arc<SqlitePool>,
    reading: Mutex<OdometerReading>,
}

impl Odometer {
    /// Load the persisted row (created by the initial migration).
    pub async fn load(db: Arc<SqlitePool>) -> ReplicaResult<Self> {
        let reading = Self::snapshot(&db).await?;
        Ok(Self {
            db,
            reading: Mutex::new(reading),
        })
    }

    /// Read the persisted counters without taking the lock. Intended for
    /// reporting; may trail an in-flight adjustment.
    pub async fn snapshot(db: &SqlitePool) -> ReplicaResult<OdometerReading> {
        let reading = sqlx::query_as::<Sqlite, OdometerReading>(
            "SELECT count, storesize, uploaded, downloaded, modified FROM odometer WHERE id = 1",
        )
        .fetch_optional(db)
        .await?
        .unwrap_or_default();
        Ok(reading)
    }

    /// Current in-memory counters.
    pub async fn reading(&self) -> OdometerReading {
        self.reading.lock().await.clone()
    }

    /// Apply `delta` and persist it synchronously. The in-memory counters
    /// only change once the row has been written.
    pub async fn adjust(&self, delta: OdometerDelta) -> ReplicaResult<OdometerReading> {
        let mut guard = self.reading.lock().await;
        if delta.is_zero() {
            return Ok(guard.clone());
        }
        let next = guard.apply(&delta, Utc::now());

        sqlx::query(
            "INSERT INTO odometer (id, count, storesize, uploaded, downloaded, modified)
             VALUES (1, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                count = excluded.count,
                storesize = excluded.storesize,
                uploaded = excluded.uploaded,
                downloaded = excluded.downloaded,
                modified = excluded.modified",
        )
        .bind(next.count)
        .bind(next.storesize)
        .bind(next.uploaded)
        .bind(next.downloaded)
        .bind(next.modified)
        .execute(&*self.db)
        .await?;

        debug!(?delta, "odometer adjusted");
        *guard = next.clone();
        Ok(next)
    }
}
