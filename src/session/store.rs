// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted session table with lazy expiry.
//!
//! There is no background timer: every operation first deletes the rows
//! whose `issued_when` is older than the session lifetime. The sweep, the
//! check and the mutation of each operation run under one connection lock,
//! and the matching [`SessionRegistry`] entries are installed or dropped
//! while that lock is held.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::registry::{SessionContext, SessionRegistry};
use crate::security::resilient_lock;
use crate::types::SessionId;

/// Fixed-width UTC timestamp, so string order equals time order.
const ISSUED_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    Conflict(SessionId),
    #[error("session storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("failed to prepare session storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn format_instant(t: DateTime<Utc>) -> String {
    t.format(ISSUED_FORMAT).to_string()
}

/// A live row of `sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub issued_at: DateTime<Utc>,
}

pub struct SessionStore {
    conn: Mutex<Connection>,
    lifetime: Duration,
    registry: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    /// Open (creating if needed) the session database at `path`.
    pub fn open(
        path: &Path,
        lifetime: Duration,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?, lifetime, registry)
    }

    pub fn open_in_memory(
        lifetime: Duration,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, SessionError> {
        Self::from_connection(Connection::open_in_memory()?, lifetime, registry)
    }

    fn from_connection(
        conn: Connection,
        lifetime: Duration,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, SessionError> {
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions(
                id INTEGER PRIMARY KEY,
                issued_when TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            lifetime,
            registry,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Delete expired rows and their contexts. Caller holds the lock.
    fn sweep_locked(&self, conn: &Connection) -> Result<usize, SessionError> {
        let cutoff = format_instant(self.clock.now() - self.lifetime);
        let mut stmt = conn.prepare("DELETE FROM sessions WHERE issued_when < ?1 RETURNING id")?;
        let expired = stmt
            .query_map(params![cutoff], |row| row.get::<_, SessionId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for id in &expired {
            self.registry.remove(*id);
            tracing::info!(session = id, "Session expired");
        }
        Ok(expired.len())
    }

    /// Delete every session older than the lifetime.
    pub fn sweep_expired(&self) -> Result<usize, SessionError> {
        let conn = resilient_lock(&self.conn);
        self.sweep_locked(&conn)
    }

    /// Create session `id` and its fresh context.
    ///
    /// Fails with [`SessionError::Conflict`] if a live session already holds
    /// the id; the caller picks a new one.
    pub fn create(&self, id: SessionId) -> Result<Arc<SessionContext>, SessionError> {
        let conn = resilient_lock(&self.conn);
        self.sweep_locked(&conn)?;

        let inserted = conn.execute(
            "INSERT INTO sessions(id, issued_when) VALUES(?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![id, format_instant(self.clock.now())],
        )?;
        if inserted == 0 {
            return Err(SessionError::Conflict(id));
        }

        let context = self.registry.install(id);
        tracing::info!(session = id, "Session created");
        Ok(context)
    }

    /// Whether `id` is live. A row without a context does not count.
    pub fn exists(&self, id: SessionId) -> Result<bool, SessionError> {
        Ok(self.context(id)?.is_some())
    }

    /// The context of a live session.
    pub fn context(&self, id: SessionId) -> Result<Option<Arc<SessionContext>>, SessionError> {
        let conn = resilient_lock(&self.conn);
        self.sweep_locked(&conn)?;

        let rows: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(self.registry.get(id))
    }

    /// Remove session `id` and its context. Only the exact row is deleted.
    pub fn invalidate(&self, id: SessionId) -> Result<bool, SessionError> {
        let conn = resilient_lock(&self.conn);
        self.sweep_locked(&conn)?;
        self.registry.remove(id);
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if deleted > 0 {
            tracing::info!(session = id, "Session invalidated");
        }
        Ok(deleted > 0)
    }

    /// Live sessions, oldest first.
    pub fn live_sessions(&self) -> Result<Vec<Session>, SessionError> {
        let conn = resilient_lock(&self.conn);
        self.sweep_locked(&conn)?;

        let mut stmt = conn.prepare("SELECT id, issued_when FROM sessions ORDER BY issued_when")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, SessionId>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, issued)| {
                NaiveDateTime::parse_from_str(&issued, ISSUED_FORMAT)
                    .ok()
                    .map(|naive| Session {
                        id,
                        issued_at: naive.and_utc(),
                    })
            })
            .collect())
    }
}
