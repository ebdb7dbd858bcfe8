//! Shared primitive types used across the entire engine.

use chrono::{DateTime, Utc};

/// Tenant (organization) identifier. Every query is scoped by one.
pub type TenantId = String;

/// A stable, unique identifier for a lead, agent, user or assignment.
pub type EntityId = String;

pub type LeadId = EntityId;
pub type AgentId = EntityId;
pub type UserId = EntityId;
pub type AssignmentId = EntityId;

/// All engine timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Timestamps are persisted as Unix seconds.
pub fn to_epoch(ts: Timestamp) -> i64 {
    ts.timestamp()
}

pub fn from_epoch(secs: i64) -> Timestamp {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// One page of a listing plus the total row count behind it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Page<T> {
    pub items:    Vec<T>,
    pub total:    u64,
    pub limit:    u32,
    pub offset:   u32,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, limit: u32, offset: u32) -> Self {
        let has_more = u64::from(offset) + (items.len() as u64) < total;
        Self { items, total, limit, offset, has_more }
    }
}

/// Largest page any listing returns.
pub const MAX_PAGE_SIZE: u32 = 100;

pub(crate) fn check_page_size(limit: u32) -> crate::error::EngineResult<()> {
    if (1..=MAX_PAGE_SIZE).contains(&limit) {
        Ok(())
    } else {
        Err(crate::error::EngineError::validation(
            "limit",
            format!("must be between 1 and {MAX_PAGE_SIZE}"),
        ))
    }
}
