//! Assignment Ledger queries.
//!
//! Every path that opens a claim goes through `claim_lead`, and every path
//! that closes one moves the agent's load counter in the same transaction.

use super::{
    agent::{adjust_load, agent_in_tenant},
    append_event,
    lead::{insert_call_outcome, lead_in_tenant, set_lead_status},
    parse_column, EngineStore, OPEN_STATUSES,
};
use crate::{
    assignment::{
        AssignBatch, AssignedBy, Assignment, AssignmentQuery, AssignmentStats, AssignmentStatus,
        LeadConflict, NewAssignment,
    },
    error::{EngineError, EngineResult},
    event::EngineEvent,
    lead::{CallOutcome, CallRecord, LeadFilters},
    types::{from_epoch, to_epoch, Page, Timestamp},
};
use rusqlite::{params, params_from_iter, types::Value, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

const ASSIGNMENT_COLUMNS: &str =
    "a.assignment_id, a.tenant_id, a.lead_id, a.agent_id, a.assigned_by, a.status,
     a.assigned_at, a.expires_at, a.updated_at";

fn assignment_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        assignment_id: row.get(0)?,
        tenant_id:     row.get(1)?,
        lead_id:       row.get(2)?,
        agent_id:      row.get(3)?,
        assigned_by:   parse_column(4, row.get(4)?, AssignedBy::decode)?,
        status:        parse_column(5, row.get(5)?, AssignmentStatus::parse)?,
        assigned_at:   from_epoch(row.get(6)?),
        expires_at:    from_epoch(row.get(7)?),
        updated_at:    from_epoch(row.get(8)?),
    })
}

fn assignment_by_id(
    conn: &Connection,
    tenant_id: &str,
    assignment_id: &str,
) -> EngineResult<Option<Assignment>> {
    let sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM assignment a
         WHERE a.tenant_id = ?1 AND a.assignment_id = ?2"
    );
    conn.query_row(&sql, params![tenant_id, assignment_id], assignment_row_mapper)
        .optional()
        .map_err(Into::into)
}

/// The current holder of a lead, if any.
pub(crate) fn open_claim(conn: &Connection, lead_id: &str) -> EngineResult<Option<LeadConflict>> {
    conn.query_row(
        &format!(
            "SELECT a.lead_id, l.first_name || ' ' || l.last_name, a.assignment_id,
                    a.agent_id, COALESCE(ag.display_name, a.agent_id)
             FROM assignment a
             JOIN lead l ON l.lead_id = a.lead_id
             LEFT JOIN agent ag ON ag.agent_id = a.agent_id
             WHERE a.lead_id = ?1 AND a.status IN {OPEN_STATUSES}"
        ),
        params![lead_id],
        |row| {
            Ok(LeadConflict {
                lead_id:       row.get(0)?,
                lead_name:     row.get(1)?,
                assignment_id: row.get(2)?,
                held_by:       row.get(3)?,
                held_by_name:  row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Expire one open assignment and free its agent's slot. False when
/// another writer closed it first.
fn expire_claim(conn: &Connection, a: &Assignment, now: Timestamp) -> EngineResult<bool> {
    if !a.status.can_expire() {
        return Ok(false);
    }
    if !swap_status(conn, &a.tenant_id, &a.assignment_id, a.status, AssignmentStatus::Expired, now)? {
        return Ok(false);
    }
    adjust_load(conn, &a.agent_id, -1)?;
    append_event(
        conn,
        &a.tenant_id,
        "system",
        now,
        &EngineEvent::AssignmentExpired {
            assignment_id: a.assignment_id.clone(),
            lead_id:       a.lead_id.clone(),
            agent_id:      a.agent_id.clone(),
            expired_at:    now,
        },
    )?;
    Ok(true)
}

/// A claim past its deadline no longer holds the lead, whether or not the
/// reaper has reached it. Must run inside a write transaction.
pub(crate) fn release_lapsed_claim(conn: &Connection, lead_id: &str, now: Timestamp) -> EngineResult<bool> {
    let lapsed = conn
        .query_row(
            &format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM assignment a
                 WHERE a.lead_id = ?1 AND a.status IN {OPEN_STATUSES} AND a.expires_at <= ?2"
            ),
            params![lead_id, to_epoch(now)],
            assignment_row_mapper,
        )
        .optional()?;
    match lapsed {
        Some(a) => expire_claim(conn, &a, now),
        None => Ok(false),
    }
}

/// Open a claim on one lead, or report who already holds it.
/// Must run inside a write transaction.
pub(crate) fn claim_lead(
    conn: &Connection,
    new: &NewAssignment,
    now: Timestamp,
) -> EngineResult<Result<Assignment, LeadConflict>> {
    release_lapsed_claim(conn, &new.lead_id, now)?;
    if let Some(conflict) = open_claim(conn, &new.lead_id)? {
        return Ok(Err(conflict));
    }

    let assignment = Assignment {
        assignment_id: Uuid::new_v4().to_string(),
        tenant_id:     new.tenant_id.clone(),
        lead_id:       new.lead_id.clone(),
        agent_id:      new.agent_id.clone(),
        assigned_by:   new.assigned_by.clone(),
        status:        AssignmentStatus::Pending,
        assigned_at:   now,
        expires_at:    new.expires_at,
        updated_at:    now,
    };
    let inserted = conn.execute(
        "INSERT INTO assignment (
            assignment_id, tenant_id, lead_id, agent_id, assigned_by, status,
            assigned_at, expires_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            &assignment.assignment_id,
            &assignment.tenant_id,
            &assignment.lead_id,
            &assignment.agent_id,
            assignment.assigned_by.encode(),
            assignment.status.as_str(),
            to_epoch(assignment.assigned_at),
            to_epoch(assignment.expires_at),
            to_epoch(assignment.updated_at),
        ],
    );
    match inserted {
        Ok(_) => {}
        // The partial unique index caught a claim the read above missed.
        Err(rusqlite::Error::SqliteFailure(err, msg)) if err.code == ErrorCode::ConstraintViolation => {
            if let Some(conflict) = open_claim(conn, &new.lead_id)? {
                return Ok(Err(conflict));
            }
            return Err(rusqlite::Error::SqliteFailure(err, msg).into());
        }
        Err(e) => return Err(e.into()),
    }

    adjust_load(conn, &assignment.agent_id, 1)?;
    append_event(
        conn,
        &assignment.tenant_id,
        assignment.assigned_by.actor_label(),
        now,
        &EngineEvent::AssignmentCreated {
            assignment_id: assignment.assignment_id.clone(),
            lead_id:       assignment.lead_id.clone(),
            agent_id:      assignment.agent_id.clone(),
            assigned_by:   assignment.assigned_by.clone(),
            expires_at:    assignment.expires_at,
        },
    )?;
    Ok(Ok(assignment))
}

/// Compare-and-set on status. False when the row is no longer in `from`,
/// or when it has lapsed and `to` is anything but expired.
fn swap_status(
    conn: &Connection,
    tenant_id: &str,
    assignment_id: &str,
    from: AssignmentStatus,
    to: AssignmentStatus,
    now: Timestamp,
) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE assignment SET status = ?1, updated_at = ?2
         WHERE tenant_id = ?3 AND assignment_id = ?4 AND status = ?5
           AND (?1 = 'expired' OR expires_at > ?2)",
        params![to.as_str(), to_epoch(now), tenant_id, assignment_id, from.as_str()],
    )?;
    Ok(n == 1)
}

fn active_agent_or_not_found(
    conn: &Connection,
    tenant_id: &str,
    agent_id: &str,
) -> EngineResult<()> {
    match agent_in_tenant(conn, tenant_id, agent_id)? {
        Some(agent) if agent.is_active => Ok(()),
        _ => Err(EngineError::not_found("agent", agent_id)),
    }
}

impl EngineStore {
    // ── Claims ─────────────────────────────────────────────────

    pub fn create_assignment(&mut self, new: &NewAssignment, now: Timestamp) -> EngineResult<Assignment> {
        let tx = self.write_tx()?;
        active_agent_or_not_found(&tx, &new.tenant_id, &new.agent_id)?;
        if lead_in_tenant(&tx, &new.tenant_id, &new.lead_id)?.is_none() {
            return Err(EngineError::not_found("lead", new.lead_id.clone()));
        }
        let assignment = match claim_lead(&tx, new, now)? {
            Ok(a) => a,
            Err(conflict) => {
                return Err(EngineError::Conflict { conflicts: vec![conflict] });
            }
        };
        tx.commit()?;
        Ok(assignment)
    }

    /// Claim each lead for one agent. Held leads are reported, the rest proceed.
    pub fn assign_leads(
        &mut self,
        tenant_id: &str,
        lead_ids: &[String],
        agent_id: &str,
        assigned_by: &AssignedBy,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> EngineResult<AssignBatch> {
        let tx = self.write_tx()?;
        active_agent_or_not_found(&tx, tenant_id, agent_id)?;

        let mut missing = Vec::new();
        for lead_id in lead_ids {
            if lead_in_tenant(&tx, tenant_id, lead_id)?.is_none() {
                missing.push(lead_id.as_str());
            }
        }
        if !missing.is_empty() {
            return Err(EngineError::not_found("lead", missing.join(", ")));
        }

        let mut batch = AssignBatch::default();
        for lead_id in lead_ids {
            let new = NewAssignment {
                tenant_id:   tenant_id.to_string(),
                lead_id:     lead_id.clone(),
                agent_id:    agent_id.to_string(),
                assigned_by: assigned_by.clone(),
                expires_at,
            };
            match claim_lead(&tx, &new, now)? {
                Ok(a) => batch.assignments.push(a),
                Err(c) => batch.conflicts.push(c),
            }
        }
        tx.commit()?;
        Ok(batch)
    }

    /// Claim up to `count` unheld leads matching `filters`, oldest first.
    /// The selection and the claims share one write lock, so concurrent
    /// bulk requests take disjoint leads.
    pub fn bulk_claim(
        &mut self,
        tenant_id: &str,
        agent_id: &str,
        count: u32,
        filters: &LeadFilters,
        assigned_by: &AssignedBy,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> EngineResult<Vec<Assignment>> {
        let tx = self.write_tx()?;
        active_agent_or_not_found(&tx, tenant_id, agent_id)?;

        let mut sql = String::from("SELECT l.lead_id FROM lead l WHERE l.tenant_id = ?");
        let mut args: Vec<Value> = vec![Value::Text(tenant_id.to_string())];
        match filters.status {
            Some(status) => {
                sql.push_str(" AND l.status = ?");
                args.push(Value::Text(status.as_str().to_string()));
            }
            None => sql.push_str(" AND l.status IN ('new', 'retry_pending')"),
        }
        if let Some(campaign) = &filters.campaign_id {
            sql.push_str(" AND l.campaign_id = ?");
            args.push(Value::Text(campaign.clone()));
        }
        if let Some(industry) = &filters.industry {
            sql.push_str(" AND l.industry = ?");
            args.push(Value::Text(industry.clone()));
        }
        if let Some(location) = &filters.location {
            sql.push_str(" AND LOWER(l.location) LIKE '%' || LOWER(?) || '%'");
            args.push(Value::Text(location.clone()));
        }
        sql.push_str(&format!(
            " AND NOT EXISTS (SELECT 1 FROM assignment a
                              WHERE a.lead_id = l.lead_id AND a.status IN {OPEN_STATUSES}
                                AND a.expires_at > ?)
              ORDER BY l.created_at ASC, l.lead_id ASC LIMIT ?"
        ));
        args.push(Value::Integer(to_epoch(now)));
        args.push(Value::Integer(i64::from(count)));

        let lead_ids: Vec<String> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(lead_ids.len());
        for lead_id in lead_ids {
            let new = NewAssignment {
                tenant_id:   tenant_id.to_string(),
                lead_id,
                agent_id:    agent_id.to_string(),
                assigned_by: assigned_by.clone(),
                expires_at,
            };
            if let Ok(a) = claim_lead(&tx, &new, now)? {
                claimed.push(a);
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    // ── Transitions ────────────────────────────────────────────

    pub fn get_assignment(&self, tenant_id: &str, assignment_id: &str) -> EngineResult<Option<Assignment>> {
        assignment_by_id(&self.conn, tenant_id, assignment_id)
    }

    /// Move an assignment from `from` to `to`. Returns None if another
    /// writer moved it first.
    pub fn transition_assignment(
        &mut self,
        tenant_id: &str,
        assignment_id: &str,
        from: AssignmentStatus,
        to: AssignmentStatus,
        actor: &str,
        now: Timestamp,
    ) -> EngineResult<Option<Assignment>> {
        let tx = self.write_tx()?;
        if !swap_status(&tx, tenant_id, assignment_id, from, to, now)? {
            return Ok(None);
        }
        let updated = assignment_by_id(&tx, tenant_id, assignment_id)?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        if to.is_terminal() {
            adjust_load(&tx, &updated.agent_id, -1)?;
        }
        append_event(
            &tx,
            tenant_id,
            actor,
            now,
            &EngineEvent::AssignmentTransitioned {
                assignment_id: updated.assignment_id.clone(),
                lead_id:       updated.lead_id.clone(),
                agent_id:      updated.agent_id.clone(),
                from,
                to,
            },
        )?;
        tx.commit()?;
        Ok(Some(updated))
    }

    /// Complete an assignment with the call's outcome: ledger, load counter,
    /// call record and lead status move together.
    pub fn complete_with_outcome(
        &mut self,
        tenant_id: &str,
        assignment_id: &str,
        from: AssignmentStatus,
        outcome: CallOutcome,
        actor: &str,
        now: Timestamp,
    ) -> EngineResult<Option<(Assignment, CallRecord)>> {
        let tx = self.write_tx()?;
        if !swap_status(&tx, tenant_id, assignment_id, from, AssignmentStatus::Completed, now)? {
            return Ok(None);
        }
        let updated = assignment_by_id(&tx, tenant_id, assignment_id)?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        adjust_load(&tx, &updated.agent_id, -1)?;

        let call = CallRecord {
            call_id:       Uuid::new_v4().to_string(),
            lead_id:       updated.lead_id.clone(),
            agent_id:      Some(updated.agent_id.clone()),
            assignment_id: Some(updated.assignment_id.clone()),
            outcome,
            occurred_at:   now,
        };
        insert_call_outcome(&tx, tenant_id, &call)?;
        set_lead_status(&tx, tenant_id, &updated.lead_id, outcome.resulting_lead_status())?;
        if outcome == CallOutcome::DncRequest {
            tx.execute(
                "UPDATE lead SET reuse_enabled = 0 WHERE tenant_id = ?1 AND lead_id = ?2",
                params![tenant_id, &updated.lead_id],
            )?;
        }

        append_event(
            &tx,
            tenant_id,
            actor,
            now,
            &EngineEvent::AssignmentTransitioned {
                assignment_id: updated.assignment_id.clone(),
                lead_id:       updated.lead_id.clone(),
                agent_id:      updated.agent_id.clone(),
                from,
                to:            AssignmentStatus::Completed,
            },
        )?;
        append_event(
            &tx,
            tenant_id,
            actor,
            now,
            &EngineEvent::CallOutcomeRecorded {
                call_id:       call.call_id.clone(),
                lead_id:       call.lead_id.clone(),
                assignment_id: call.assignment_id.clone(),
                outcome,
            },
        )?;
        tx.commit()?;
        Ok(Some((updated, call)))
    }

    /// Expire up to `limit` open assignments whose deadline has passed.
    pub fn expire_stale(&mut self, tenant_id: &str, now: Timestamp, limit: u32) -> EngineResult<Vec<Assignment>> {
        let tx = self.write_tx()?;
        let stale: Vec<Assignment> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM assignment a
                 WHERE a.tenant_id = ?1 AND a.status IN {OPEN_STATUSES} AND a.expires_at <= ?2
                 ORDER BY a.expires_at ASC, a.assignment_id ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![tenant_id, to_epoch(now), limit], assignment_row_mapper)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut expired = Vec::with_capacity(stale.len());
        for mut a in stale {
            if !expire_claim(&tx, &a, now)? {
                continue;
            }
            a.status = AssignmentStatus::Expired;
            a.updated_at = now;
            expired.push(a);
        }
        tx.commit()?;
        Ok(expired)
    }

    /// Expire one assignment if it is past its deadline and still open.
    pub fn expire_assignment(
        &mut self,
        tenant_id: &str,
        assignment_id: &str,
        now: Timestamp,
    ) -> EngineResult<Option<Assignment>> {
        let tx = self.write_tx()?;
        let Some(mut a) = assignment_by_id(&tx, tenant_id, assignment_id)? else {
            return Ok(None);
        };
        if !a.is_stale(now) || !expire_claim(&tx, &a, now)? {
            return Ok(None);
        }
        tx.commit()?;
        a.status = AssignmentStatus::Expired;
        a.updated_at = now;
        Ok(Some(a))
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn list_assignments(&self, tenant_id: &str, q: &AssignmentQuery) -> EngineResult<Page<Assignment>> {
        let mut filter = String::from(" WHERE a.tenant_id = ?");
        let mut args: Vec<Value> = vec![Value::Text(tenant_id.to_string())];
        if let Some(status) = q.status {
            filter.push_str(" AND a.status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(campaign) = &q.campaign_id {
            filter.push_str(" AND l.campaign_id = ?");
            args.push(Value::Text(campaign.clone()));
        }
        let from = "FROM assignment a JOIN lead l ON l.lead_id = a.lead_id";

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) {from}{filter}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut page_args = args;
        page_args.push(Value::Integer(i64::from(q.limit)));
        page_args.push(Value::Integer(i64::from(q.offset)));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} {from}{filter}
             ORDER BY a.assigned_at DESC, a.assignment_id ASC LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(page_args), assignment_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total as u64, q.limit, q.offset))
    }

    /// One agent's worklist, oldest first.
    pub fn assignments_for_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
        status: Option<AssignmentStatus>,
        limit: u32,
        offset: u32,
    ) -> EngineResult<Page<Assignment>> {
        let status = status.map(|s| s.as_str());
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM assignment a
             WHERE a.tenant_id = ?1 AND a.agent_id = ?2 AND (?3 IS NULL OR a.status = ?3)",
            params![tenant_id, agent_id, status],
            |row| row.get(0),
        )?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignment a
             WHERE a.tenant_id = ?1 AND a.agent_id = ?2 AND (?3 IS NULL OR a.status = ?3)
             ORDER BY a.assigned_at ASC, a.assignment_id ASC LIMIT ?4 OFFSET ?5"
        ))?;
        let items = stmt
            .query_map(params![tenant_id, agent_id, status, limit, offset], assignment_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total as u64, limit, offset))
    }

    /// Full ledger history of one lead, oldest first.
    pub fn assignments_for_lead(&self, tenant_id: &str, lead_id: &str) -> EngineResult<Vec<Assignment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignment a
             WHERE a.tenant_id = ?1 AND a.lead_id = ?2
             ORDER BY a.assigned_at ASC, a.rowid ASC"
        ))?;
        let items = stmt
            .query_map(params![tenant_id, lead_id], assignment_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn open_assignment_count(&self, tenant_id: &str, lead_id: &str) -> EngineResult<u32> {
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM assignment
                 WHERE tenant_id = ?1 AND lead_id = ?2 AND status IN {OPEN_STATUSES}"
            ),
            params![tenant_id, lead_id],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn assignment_stats(&self, tenant_id: &str, since: Option<Timestamp>) -> EngineResult<AssignmentStats> {
        let since = since.map(to_epoch);
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'pending'), 0),
                    COALESCE(SUM(status = 'in_progress'), 0),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'cancelled'), 0),
                    COALESCE(SUM(status = 'expired'), 0),
                    COUNT(DISTINCT agent_id)
             FROM assignment
             WHERE tenant_id = ?1 AND (?2 IS NULL OR assigned_at >= ?2)",
            params![tenant_id, since],
            |row| {
                Ok(AssignmentStats {
                    total:              row.get::<_, i64>(0)? as u64,
                    pending:            row.get::<_, i64>(1)? as u64,
                    in_progress:        row.get::<_, i64>(2)? as u64,
                    completed:          row.get::<_, i64>(3)? as u64,
                    cancelled:          row.get::<_, i64>(4)? as u64,
                    expired:            row.get::<_, i64>(5)? as u64,
                    active_agent_count: row.get::<_, i64>(6)? as u64,
                    completion_rate:    0,
                })
            },
        )?;
        Ok(stats.with_completion_rate())
    }
}
