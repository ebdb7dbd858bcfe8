//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! Components call store methods — they never execute SQL directly.
//!
//! RULE: Any read-then-write sequence runs inside `write_tx()`, an
//! IMMEDIATE transaction. The write lock is held from the first read,
//! so every check made inside it is still true at commit time, across
//! all connections to the same database file.

use crate::{
    error::EngineResult,
    event::{EngineEvent, EventLogEntry},
    types::{from_epoch, to_epoch, Timestamp},
};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::time::Duration;

mod agent;
mod assignment;
mod lead;
mod reuse;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQL fragment for the statuses that hold a lead.
pub(crate) const OPEN_STATUSES: &str = "('pending', 'in_progress')";

pub struct EngineStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
    busy_timeout: Duration,
}

impl EngineStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with an explicit lock wait. Concurrent writers queue on the
    /// busy handler instead of failing immediately.
    pub fn open_with_timeout(path: &str, busy_timeout: Duration) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        // WAL only takes effect for real files; in-memory databases keep "memory".
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
            busy_timeout,
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Open a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    pub fn reopen(&self) -> EngineResult<Self> {
        match &self.path {
            Some(p) => Self::open_with_timeout(p, self.busy_timeout),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order. Safe to run repeatedly.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_directory.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_assignments.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_reuse.sql"))?;
        Ok(())
    }

    fn write_tx(&mut self) -> EngineResult<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    // ── Tenants ────────────────────────────────────────────────

    /// Every tenant with agents or leads on record.
    pub fn tenants(&self) -> EngineResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id FROM agent
             UNION
             SELECT tenant_id FROM lead
             ORDER BY tenant_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn events_for_tenant(&self, tenant_id: &str, limit: u32) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, occurred_at, actor, event_type, entity_id, payload
             FROM event_log WHERE tenant_id = ?1
             ORDER BY id ASC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![tenant_id, limit], |row| {
                Ok(EventLogEntry {
                    id:          Some(row.get(0)?),
                    tenant_id:   row.get(1)?,
                    occurred_at: from_epoch(row.get(2)?),
                    actor:       row.get(3)?,
                    event_type:  row.get(4)?,
                    entity_id:   row.get(5)?,
                    payload:     row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, tenant_id: &str, event_type: &str) -> EngineResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE tenant_id = ?1 AND event_type = ?2",
            params![tenant_id, event_type],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

/// Append to the audit log on whatever connection or transaction the
/// change itself is using.
pub(crate) fn append_event(
    conn: &Connection,
    tenant_id: &str,
    actor: &str,
    at: Timestamp,
    event: &EngineEvent,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO event_log (tenant_id, occurred_at, actor, event_type, entity_id, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            tenant_id,
            to_epoch(at),
            actor,
            event.type_name(),
            event.entity_id(),
            serde_json::to_string(event)?,
        ],
    )?;
    Ok(())
}

/// Decode a TEXT column into one of the engine's string-backed enums.
pub(crate) fn parse_column<T>(
    idx: usize,
    raw: String,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value '{raw}'").into(),
        )
    })
}
