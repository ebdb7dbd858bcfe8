//! Lead and call-outcome queries.

use super::{append_event, parse_column, EngineStore};
use crate::{
    error::{EngineError, EngineResult},
    event::EngineEvent,
    lead::{CallOutcome, CallRecord, Lead, LeadStatus, NewLead},
    reuse_policy::LastCall,
    types::{from_epoch, to_epoch, Timestamp},
};
use rusqlite::{params, Connection, OptionalExtension};

/// Lead columns, for queries that alias `lead` as `l`.
pub(crate) const LEAD_COLUMNS: &str =
    "l.lead_id, l.tenant_id, l.campaign_id, l.first_name, l.last_name, l.phone,
     l.industry, l.location, l.status, l.reuse_enabled, l.reuse_count,
     l.last_reuse_at, l.created_at";

pub(crate) const LEAD_COLUMN_COUNT: usize = 13;

pub(crate) fn lead_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        lead_id:       row.get(0)?,
        tenant_id:     row.get(1)?,
        campaign_id:   row.get(2)?,
        first_name:    row.get(3)?,
        last_name:     row.get(4)?,
        phone:         row.get(5)?,
        industry:      row.get(6)?,
        location:      row.get(7)?,
        status:        parse_column(8, row.get(8)?, LeadStatus::parse)?,
        reuse_enabled: row.get::<_, i32>(9)? != 0,
        reuse_count:   row.get::<_, i64>(10)? as u32,
        last_reuse_at: row.get::<_, Option<i64>>(11)?.map(from_epoch),
        created_at:    from_epoch(row.get(12)?),
    })
}

pub(crate) fn lead_in_tenant(
    conn: &Connection,
    tenant_id: &str,
    lead_id: &str,
) -> EngineResult<Option<Lead>> {
    let sql = format!("SELECT {LEAD_COLUMNS} FROM lead l WHERE l.tenant_id = ?1 AND l.lead_id = ?2");
    conn.query_row(&sql, params![tenant_id, lead_id], lead_row_mapper)
        .optional()
        .map_err(Into::into)
}

/// The latest call against a lead; ties on time go to the later insert.
pub(crate) fn last_call(conn: &Connection, lead_id: &str) -> EngineResult<Option<LastCall>> {
    conn.query_row(
        "SELECT call_id, outcome, occurred_at, assignment_id
         FROM call_outcome WHERE lead_id = ?1
         ORDER BY occurred_at DESC, rowid DESC LIMIT 1",
        params![lead_id],
        |row| {
            Ok(LastCall {
                call_id:       row.get(0)?,
                outcome:       parse_column(1, row.get(1)?, CallOutcome::parse)?,
                occurred_at:   from_epoch(row.get(2)?),
                assignment_id: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn insert_call_outcome(
    conn: &Connection,
    tenant_id: &str,
    call: &CallRecord,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO call_outcome (
            call_id, tenant_id, lead_id, agent_id, assignment_id, outcome, occurred_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &call.call_id,
            tenant_id,
            &call.lead_id,
            call.agent_id.as_deref(),
            call.assignment_id.as_deref(),
            call.outcome.as_str(),
            to_epoch(call.occurred_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn set_lead_status(
    conn: &Connection,
    tenant_id: &str,
    lead_id: &str,
    status: LeadStatus,
) -> EngineResult<()> {
    conn.execute(
        "UPDATE lead SET status = ?1 WHERE tenant_id = ?2 AND lead_id = ?3",
        params![status.as_str(), tenant_id, lead_id],
    )?;
    Ok(())
}

impl EngineStore {
    // ── Lead ───────────────────────────────────────────────────

    pub fn insert_lead(&self, tenant_id: &str, l: &NewLead, created_at: Timestamp) -> EngineResult<Lead> {
        self.conn.execute(
            "INSERT INTO lead (
                lead_id, tenant_id, campaign_id, first_name, last_name, phone,
                industry, location, status, reuse_enabled, reuse_count, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
            params![
                &l.lead_id,
                tenant_id,
                l.campaign_id.as_deref(),
                &l.first_name,
                &l.last_name,
                &l.phone,
                l.industry.as_deref(),
                l.location.as_deref(),
                l.status.as_str(),
                if l.reuse_enabled { 1i32 } else { 0i32 },
                to_epoch(created_at),
            ],
        )?;
        lead_in_tenant(&self.conn, tenant_id, &l.lead_id)?
            .ok_or_else(|| EngineError::not_found("lead", l.lead_id.clone()))
    }

    pub fn get_lead(&self, tenant_id: &str, lead_id: &str) -> EngineResult<Option<Lead>> {
        lead_in_tenant(&self.conn, tenant_id, lead_id)
    }

    pub fn set_lead_reuse_enabled(&self, tenant_id: &str, lead_id: &str, enabled: bool) -> EngineResult<bool> {
        let n = self.conn.execute(
            "UPDATE lead SET reuse_enabled = ?1 WHERE tenant_id = ?2 AND lead_id = ?3",
            params![if enabled { 1i32 } else { 0i32 }, tenant_id, lead_id],
        )?;
        Ok(n > 0)
    }

    // ── Call outcomes ──────────────────────────────────────────

    /// Ingest one outcome from the feed that is not tied to a ledger entry.
    pub fn record_call_outcome(&mut self, tenant_id: &str, call: &CallRecord) -> EngineResult<()> {
        let tx = self.write_tx()?;
        if lead_in_tenant(&tx, tenant_id, &call.lead_id)?.is_none() {
            return Err(EngineError::not_found("lead", call.lead_id.clone()));
        }
        insert_call_outcome(&tx, tenant_id, call)?;
        append_event(
            &tx,
            tenant_id,
            "call_feed",
            call.occurred_at,
            &EngineEvent::CallOutcomeRecorded {
                call_id:       call.call_id.clone(),
                lead_id:       call.lead_id.clone(),
                assignment_id: call.assignment_id.clone(),
                outcome:       call.outcome,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn last_call_for_lead(&self, tenant_id: &str, lead_id: &str) -> EngineResult<Option<LastCall>> {
        if lead_in_tenant(&self.conn, tenant_id, lead_id)?.is_none() {
            return Ok(None);
        }
        last_call(&self.conn, lead_id)
    }
}
