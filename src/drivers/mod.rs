// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! LLM driver pool.
//!
//! A fixed, persisted set of backend descriptors with a single idle/busy
//! flag each. Allocation marks one idle descriptor busy in a single
//! conditional `UPDATE ... RETURNING`, run while holding the pool's
//! connection lock, so two callers can never walk away with the same row.
//!
//! Allocation hands out a [`DriverLease`]. Dropping the lease (or passing it
//! to [`DriverPool::release`]) marks the descriptor idle again, which covers
//! success, failure and an abandoned stream alike.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::DriverSeed;
use crate::security::resilient_lock;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("driver pool storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("unknown driver type `{0}` in pool table")]
    UnknownKind(String),
    #[error("failed to prepare pool storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a driver's backend lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Self-hosted Ollama instance.
    Local,
    /// OpenAI-compatible hosted API.
    Hosted,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hosted => "hosted",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "hosted" => Ok(Self::Hosted),
            other => Err(PoolError::UnknownKind(other.to_string())),
        }
    }
}

/// One row of `llm_drivers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    pub id: i64,
    pub uri: String,
    pub kind: DriverKind,
    pub idle: bool,
}

fn descriptor_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, bool)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get::<_, i64>(3)? != 0))
}

fn into_descriptor(raw: (i64, String, String, bool)) -> Result<DriverDescriptor, PoolError> {
    let (id, uri, kind, idle) = raw;
    Ok(DriverDescriptor {
        id,
        uri,
        kind: kind.parse()?,
        idle,
    })
}

/// Shared handle on the pool table.
#[derive(Clone)]
pub struct DriverPool {
    conn: Arc<Mutex<Connection>>,
}

impl DriverPool {
    /// Open (creating if needed) the pool database at `path`.
    pub fn open(path: &Path) -> Result<Self, PoolError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, PoolError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PoolError> {
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS llm_drivers(
                id INTEGER PRIMARY KEY,
                uri TEXT NOT NULL,
                type TEXT NOT NULL,
                idle INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert `seeds` as idle descriptors if the table is empty.
    ///
    /// The pool is a fixed set: an already-populated table is left alone.
    /// Returns the number of rows inserted.
    pub fn seed(&self, seeds: &[DriverSeed]) -> Result<usize, PoolError> {
        let mut conn = resilient_lock(&self.conn);
        let tx = conn.transaction()?;
        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM llm_drivers", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(0);
        }
        for seed in seeds {
            tx.execute(
                "INSERT INTO llm_drivers(uri, type, idle) VALUES(?1, ?2, 1)",
                params![seed.uri, seed.kind.as_str()],
            )?;
        }
        tx.commit()?;
        tracing::info!("Seeded driver pool with {} descriptor(s)", seeds.len());
        Ok(seeds.len())
    }

    /// Mark every descriptor idle. Run once at startup to clear busy flags
    /// left behind by a crashed process.
    pub fn reset_all(&self) -> Result<usize, PoolError> {
        let conn = resilient_lock(&self.conn);
        let stale = conn.execute("UPDATE llm_drivers SET idle = 1 WHERE idle = 0", [])?;
        if stale > 0 {
            tracing::warn!("Cleared {} stale busy driver flag(s)", stale);
        }
        Ok(stale)
    }

    /// Take the first idle descriptor, marking it busy in the same statement.
    /// Rows with an unknown `type` are never taken.
    ///
    /// Returns `Ok(None)` immediately when every descriptor is busy; the pool
    /// neither queues nor retries.
    pub fn allocate(&self) -> Result<Option<DriverLease>, PoolError> {
        let conn = resilient_lock(&self.conn);
        let raw = conn
            .query_row(
                "UPDATE llm_drivers SET idle = 0 \
                 WHERE id = (SELECT id FROM llm_drivers \
                             WHERE idle = 1 AND type IN ('local', 'hosted') \
                             ORDER BY id LIMIT 1) \
                 RETURNING id, uri, type, idle",
                [],
                descriptor_from_row,
            )
            .optional()?;
        drop(conn);

        let Some(raw) = raw else {
            tracing::debug!("Driver pool exhausted");
            return Ok(None);
        };
        let descriptor = into_descriptor(raw)?;

        tracing::debug!(driver = descriptor.id, kind = %descriptor.kind, "Driver allocated");
        Ok(Some(DriverLease {
            descriptor,
            conn: Arc::clone(&self.conn),
            released: false,
        }))
    }

    /// Return a leased descriptor to the pool.
    pub fn release(&self, lease: DriverLease) -> Result<(), PoolError> {
        lease.release()
    }

    /// Snapshot of every descriptor, ordered by id.
    pub fn descriptors(&self) -> Result<Vec<DriverDescriptor>, PoolError> {
        let conn = resilient_lock(&self.conn);
        let mut stmt = conn.prepare("SELECT id, uri, type, idle FROM llm_drivers ORDER BY id")?;
        let rows = stmt
            .query_map([], descriptor_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_descriptor).collect()
    }

    pub fn idle_count(&self) -> Result<usize, PoolError> {
        let conn = resilient_lock(&self.conn);
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM llm_drivers WHERE idle = 1", [], |row| {
            row.get(0)
        })?;
        Ok(n as usize)
    }
}

/// Exclusive hold on one busy descriptor.
///
/// The descriptor goes back to idle exactly once: on [`DriverLease::release`]
/// or, failing that, when the lease is dropped.
pub struct DriverLease {
    descriptor: DriverDescriptor,
    conn: Arc<Mutex<Connection>>,
    released: bool,
}

impl DriverLease {
    pub fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    /// Mark the descriptor idle now, surfacing storage errors.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.mark_idle()
    }

    fn mark_idle(&mut self) -> Result<(), PoolError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let conn = resilient_lock(&self.conn);
        conn.execute(
            "UPDATE llm_drivers SET idle = 1 WHERE id = ?1",
            params![self.descriptor.id],
        )?;
        tracing::debug!(driver = self.descriptor.id, "Driver released");
        Ok(())
    }
}

impl fmt::Debug for DriverLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverLease")
            .field("descriptor", &self.descriptor)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for DriverLease {
    fn drop(&mut self) {
        if let Err(e) = self.mark_idle() {
            tracing::error!(driver = self.descriptor.id, "Failed to release driver: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(seeds: &[DriverSeed]) -> DriverPool {
        let pool = DriverPool::open_in_memory().unwrap();
        pool.seed(seeds).unwrap();
        pool
    }

    fn one_local() -> Vec<DriverSeed> {
        vec![DriverSeed::new("http://localhost:11434", DriverKind::Local)]
    }

    #[test]
    fn test_seed_only_populates_empty_table() {
        let pool = pool_with(&one_local());
        assert_eq!(pool.seed(&one_local()).unwrap(), 0);
        assert_eq!(pool.descriptors().unwrap().len(), 1);
    }

    #[test]
    fn test_allocate_marks_busy_until_released() {
        let pool = pool_with(&one_local());

        let lease = pool.allocate().unwrap().expect("one idle driver");
        assert_eq!(lease.descriptor().kind, DriverKind::Local);
        assert!(!lease.descriptor().idle);
        assert_eq!(pool.idle_count().unwrap(), 0);
        assert!(pool.allocate().unwrap().is_none());

        pool.release(lease).unwrap();
        assert_eq!(pool.idle_count().unwrap(), 1);
        assert!(pool.allocate().unwrap().is_some());
    }

    #[test]
    fn test_dropping_lease_releases_descriptor() {
        let pool = pool_with(&one_local());
        {
            let _lease = pool.allocate().unwrap().unwrap();
            assert_eq!(pool.idle_count().unwrap(), 0);
        }
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[test]
    fn test_allocation_hands_out_distinct_descriptors() {
        let pool = pool_with(&[
            DriverSeed::new("http://a:11434", DriverKind::Local),
            DriverSeed::new("https://b/api/v1", DriverKind::Hosted),
        ]);
        let first = pool.allocate().unwrap().unwrap();
        let second = pool.allocate().unwrap().unwrap();
        assert_ne!(first.descriptor().id, second.descriptor().id);
        assert!(pool.allocate().unwrap().is_none());
    }

    #[test]
    fn test_reset_all_clears_stale_busy_flags() {
        let pool = pool_with(&one_local());
        let lease = pool.allocate().unwrap().unwrap();
        // Simulate a crash: the flag stays busy without running Drop.
        std::mem::forget(lease);
        assert_eq!(pool.idle_count().unwrap(), 0);

        assert_eq!(pool.reset_all().unwrap(), 1);
        assert_eq!(pool.idle_count().unwrap(), 1);
    }

    #[test]
    fn test_persisted_pool_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("llm_drivers.sql");
        {
            let pool = DriverPool::open(&path).unwrap();
            pool.seed(&one_local()).unwrap();
        }
        let pool = DriverPool::open(&path).unwrap();
        let descriptors = pool.descriptors().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].uri, "http://localhost:11434");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!("remote".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_unknown_kind_row_is_skipped_not_stranded() {
        let pool = DriverPool::open_in_memory().unwrap();
        {
            let conn = resilient_lock(&pool.conn);
            conn.execute(
                "INSERT INTO llm_drivers(uri, type, idle) VALUES('http://gpu-box', 'remote', 1)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO llm_drivers(uri, type, idle) VALUES('http://localhost:11434', 'local', 1)",
                [],
            )
            .unwrap();
        }

        let lease = pool.allocate().unwrap().expect("the local row is usable");
        assert_eq!(lease.descriptor().kind, DriverKind::Local);
        assert!(pool.allocate().unwrap().is_none());

        let bad_row_idle: i64 = resilient_lock(&pool.conn)
            .query_row("SELECT idle FROM llm_drivers WHERE type = 'remote'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(bad_row_idle, 1);
    }
}
