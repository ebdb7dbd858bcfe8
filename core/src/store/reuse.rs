//! Reuse policy rows, candidate scans, the atomic recycle and the reuse log.

use super::{
    agent::pick_agent,
    append_event,
    assignment::{claim_lead, release_lapsed_claim},
    lead::{last_call, lead_in_tenant, lead_row_mapper, LEAD_COLUMNS, LEAD_COLUMN_COUNT},
    parse_column, EngineStore, OPEN_STATUSES,
};
use crate::{
    agent::CreditGate,
    assignment::{AssignedBy, NewAssignment},
    error::EngineResult,
    event::EngineEvent,
    lead::CallOutcome,
    reuse_policy::{LastCall, LeadReuseState, ReusePolicy, ReuseRule, ReuseSkip, TimeWindow},
    reuse_scheduler::{
        AttemptEffectiveness, DailyReuseActivity, ReuseCandidate, ReuseLogEntry, ReuseMetrics,
        ReusedLead,
    },
    types::{from_epoch, to_epoch, Timestamp},
};
use rusqlite::{params, Connection, OptionalExtension};

/// Leads whose latest call matches the rule, ordered oldest outcome first.
/// Bind order: tenant, max attempts, cutoff, triggers JSON, now.
fn candidate_sql(tail: &str) -> String {
    format!(
        "WITH latest AS (
            SELECT co.lead_id, co.call_id, co.outcome, co.occurred_at, co.assignment_id
            FROM call_outcome co
            WHERE co.tenant_id = ?1
              AND co.rowid = (
                  SELECT c2.rowid FROM call_outcome c2
                  WHERE c2.lead_id = co.lead_id
                  ORDER BY c2.occurred_at DESC, c2.rowid DESC
                  LIMIT 1)
         )
         SELECT {LEAD_COLUMNS},
                latest.call_id, latest.outcome, latest.occurred_at, latest.assignment_id
         FROM lead l
         JOIN latest ON latest.lead_id = l.lead_id
         WHERE l.tenant_id = ?1
           AND l.reuse_enabled = 1
           AND l.reuse_count < ?2
           AND (l.last_reuse_at IS NULL OR l.last_reuse_at <= ?3)
           AND latest.occurred_at <= ?3
           AND latest.outcome IN (SELECT value FROM json_each(?4))
           AND NOT EXISTS (
               SELECT 1 FROM assignment a
               WHERE a.lead_id = l.lead_id AND a.status IN {OPEN_STATUSES}
                 AND a.expires_at > ?5)
         {tail}"
    )
}

fn candidate_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReuseCandidate> {
    let base = LEAD_COLUMN_COUNT;
    Ok(ReuseCandidate {
        lead: lead_row_mapper(row)?,
        last_call: LastCall {
            call_id:       row.get(base)?,
            outcome:       parse_column(base + 1, row.get(base + 1)?, CallOutcome::parse)?,
            occurred_at:   from_epoch(row.get(base + 2)?),
            assignment_id: row.get(base + 3)?,
        },
    })
}

fn triggers_json(rule: &ReuseRule) -> EngineResult<String> {
    let names: Vec<&str> = rule.triggers.iter().map(|o| o.as_str()).collect();
    Ok(serde_json::to_string(&names)?)
}

/// A lead's state as the eligibility rule sees it, read under the caller's lock.
pub(crate) fn reuse_state(
    conn: &Connection,
    tenant_id: &str,
    lead_id: &str,
) -> EngineResult<Option<LeadReuseState>> {
    let Some(lead) = lead_in_tenant(conn, tenant_id, lead_id)? else {
        return Ok(None);
    };
    let open_assignment = conn
        .query_row(
            &format!(
                "SELECT assignment_id FROM assignment
                 WHERE lead_id = ?1 AND status IN {OPEN_STATUSES}"
            ),
            params![lead_id],
            |row| row.get(0),
        )
        .optional()?;
    let last_call = last_call(conn, lead_id)?;
    Ok(Some(LeadReuseState { lead, last_call, open_assignment }))
}

fn latest_assignment_id(conn: &Connection, lead_id: &str) -> EngineResult<Option<String>> {
    conn.query_row(
        "SELECT assignment_id FROM assignment WHERE lead_id = ?1
         ORDER BY assigned_at DESC, rowid DESC LIMIT 1",
        params![lead_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

impl EngineStore {
    // ── Policy ─────────────────────────────────────────────────

    /// The tenant's policy. A row holding `defaults` is written on first read.
    pub fn reuse_policy(
        &self,
        tenant_id: &str,
        defaults: &ReusePolicy,
        now: Timestamp,
    ) -> EngineResult<ReusePolicy> {
        let triggers: Vec<&str> = defaults.trigger_outcomes.iter().map(|o| o.as_str()).collect();
        self.conn.execute(
            "INSERT OR IGNORE INTO reuse_policy (
                tenant_id, auto_reuse_enabled, max_reuse_attempts, reuse_delay_hours,
                trigger_outcomes, time_window, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tenant_id,
                defaults.auto_reuse_enabled as i32,
                defaults.max_reuse_attempts,
                defaults.reuse_delay_hours,
                serde_json::to_string(&triggers)?,
                defaults.time_window.as_ref().map(serde_json::to_string).transpose()?,
                to_epoch(now),
            ],
        )?;

        let (enabled, attempts, delay, triggers_raw, window_raw): (i32, i64, i64, String, Option<String>) =
            self.conn.query_row(
                "SELECT auto_reuse_enabled, max_reuse_attempts, reuse_delay_hours,
                        trigger_outcomes, time_window
                 FROM reuse_policy WHERE tenant_id = ?1",
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

        let names: Vec<String> = serde_json::from_str(&triggers_raw)?;
        let time_window: Option<TimeWindow> = window_raw
            .as_deref()
            .map(|raw| serde_json::from_str(raw))
            .transpose()?;
        Ok(ReusePolicy {
            auto_reuse_enabled: enabled != 0,
            max_reuse_attempts: attempts.max(1) as u32,
            reuse_delay_hours:  delay.max(1) as u32,
            trigger_outcomes:   names.iter().filter_map(|n| CallOutcome::parse(n)).collect(),
            time_window,
        })
    }

    pub fn save_reuse_policy(
        &mut self,
        tenant_id: &str,
        policy: &ReusePolicy,
        actor: &str,
        now: Timestamp,
    ) -> EngineResult<()> {
        let triggers: Vec<&str> = policy.trigger_outcomes.iter().map(|o| o.as_str()).collect();
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO reuse_policy (
                tenant_id, auto_reuse_enabled, max_reuse_attempts, reuse_delay_hours,
                trigger_outcomes, time_window, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(tenant_id) DO UPDATE SET
                auto_reuse_enabled = excluded.auto_reuse_enabled,
                max_reuse_attempts = excluded.max_reuse_attempts,
                reuse_delay_hours  = excluded.reuse_delay_hours,
                trigger_outcomes   = excluded.trigger_outcomes,
                time_window        = excluded.time_window,
                updated_at         = excluded.updated_at",
            params![
                tenant_id,
                policy.auto_reuse_enabled as i32,
                policy.max_reuse_attempts,
                policy.reuse_delay_hours,
                serde_json::to_string(&triggers)?,
                policy.time_window.as_ref().map(serde_json::to_string).transpose()?,
                to_epoch(now),
            ],
        )?;
        append_event(
            &tx,
            tenant_id,
            actor,
            now,
            &EngineEvent::ReusePolicyUpdated {
                auto_reuse_enabled: policy.auto_reuse_enabled,
                max_reuse_attempts: policy.max_reuse_attempts,
                reuse_delay_hours:  policy.reuse_delay_hours,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Candidates ─────────────────────────────────────────────

    /// Read-only scan of leads the rule would recycle right now.
    pub fn reuse_candidates(
        &self,
        tenant_id: &str,
        rule: &ReuseRule,
        now: Timestamp,
        limit: u32,
        offset: u32,
    ) -> EngineResult<Vec<ReuseCandidate>> {
        if rule.triggers.is_empty() {
            return Ok(Vec::new());
        }
        let sql = candidate_sql("ORDER BY latest.occurred_at ASC, l.lead_id ASC LIMIT ?6 OFFSET ?7");
        let mut stmt = self.conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(
                params![
                    tenant_id,
                    rule.max_attempts,
                    to_epoch(rule.cutoff(now)),
                    triggers_json(rule)?,
                    to_epoch(now),
                    limit,
                    offset,
                ],
                candidate_row_mapper,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }

    pub fn count_reuse_candidates(&self, tenant_id: &str, rule: &ReuseRule, now: Timestamp) -> EngineResult<u64> {
        if rule.triggers.is_empty() {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM ({})", candidate_sql(""));
        let n: i64 = self.conn.query_row(
            &sql,
            params![
                tenant_id,
                rule.max_attempts,
                to_epoch(rule.cutoff(now)),
                triggers_json(rule)?,
                to_epoch(now),
            ],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // ── Recycle ────────────────────────────────────────────────

    /// Re-check eligibility, pick an agent and hand the lead over, all under
    /// one write lock. A skip leaves nothing behind.
    pub fn reuse_lead(
        &mut self,
        tenant_id: &str,
        lead_id: &str,
        rule: &ReuseRule,
        manual: bool,
        gate: &dyn CreditGate,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> EngineResult<Result<ReusedLead, ReuseSkip>> {
        let tx = self.write_tx()?;
        if lead_in_tenant(&tx, tenant_id, lead_id)?.is_some() {
            release_lapsed_claim(&tx, lead_id, now)?;
        }
        let Some(state) = reuse_state(&tx, tenant_id, lead_id)? else {
            return Ok(Err(ReuseSkip::LeadNotFound));
        };
        if let Err(skip) = rule.evaluate(&state, now) {
            return Ok(Err(skip));
        }
        let Some(agent) = pick_agent(&tx, tenant_id, gate)? else {
            return Ok(Err(ReuseSkip::NoAvailableAgent));
        };

        let bumped = tx.execute(
            "UPDATE lead SET reuse_count = reuse_count + 1, last_reuse_at = ?1, status = 'new'
             WHERE tenant_id = ?2 AND lead_id = ?3 AND reuse_count < ?4",
            params![to_epoch(now), tenant_id, lead_id, rule.max_attempts],
        )?;
        if bumped == 0 {
            return Ok(Err(ReuseSkip::AttemptsExhausted {
                reuse_count:  state.lead.reuse_count,
                max_attempts: rule.max_attempts,
            }));
        }
        let attempt = state.lead.reuse_count + 1;

        let original_assignment_id = match state.last_call.as_ref().and_then(|c| c.assignment_id.clone()) {
            Some(id) => Some(id),
            None => latest_assignment_id(&tx, lead_id)?,
        };
        let new = NewAssignment {
            tenant_id:   tenant_id.to_string(),
            lead_id:     lead_id.to_string(),
            agent_id:    agent.agent_id.clone(),
            assigned_by: AssignedBy::SystemReuse,
            expires_at,
        };
        let assignment = match claim_lead(&tx, &new, now)? {
            Ok(a) => a,
            Err(_) => return Ok(Err(ReuseSkip::HasOpenAssignment)),
        };

        tx.execute(
            "INSERT INTO reuse_log (
                tenant_id, lead_id, original_call_id, original_assignment_id, new_assignment_id,
                reuse_reason, reassigned_to, attempt_number, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tenant_id,
                lead_id,
                state.last_call.as_ref().map(|c| c.call_id.as_str()),
                original_assignment_id,
                &assignment.assignment_id,
                if manual { "manual_reuse" } else { "automatic_reuse" },
                &agent.agent_id,
                attempt,
                to_epoch(now),
            ],
        )?;
        append_event(
            &tx,
            tenant_id,
            "system",
            now,
            &EngineEvent::LeadReused {
                lead_id:           lead_id.to_string(),
                new_assignment_id: assignment.assignment_id.clone(),
                agent_id:          agent.agent_id.clone(),
                attempt,
                manual,
            },
        )?;
        tx.commit()?;

        Ok(Ok(ReusedLead {
            lead_id:    lead_id.to_string(),
            agent_id:   agent.agent_id,
            agent_name: agent.display_name,
            attempt,
            assignment,
        }))
    }

    // ── Reuse log ──────────────────────────────────────────────

    pub fn reuse_log(&self, tenant_id: &str, lead_id: &str) -> EngineResult<Vec<ReuseLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, lead_id, original_call_id, original_assignment_id, new_assignment_id,
                    reuse_reason, reassigned_to, attempt_number, created_at
             FROM reuse_log WHERE tenant_id = ?1 AND lead_id = ?2
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![tenant_id, lead_id], |row| {
                Ok(ReuseLogEntry {
                    id:                     row.get(0)?,
                    lead_id:                row.get(1)?,
                    original_call_id:       row.get(2)?,
                    original_assignment_id: row.get(3)?,
                    new_assignment_id:      row.get(4)?,
                    reuse_reason:           row.get(5)?,
                    reassigned_to:          row.get(6)?,
                    attempt_number:         row.get::<_, i64>(7)? as u32,
                    created_at:             from_epoch(row.get(8)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Effectiveness of recycling between `from` and `to`, inclusive.
    pub fn reuse_metrics(&self, tenant_id: &str, from: Timestamp, to: Timestamp) -> EngineResult<ReuseMetrics> {
        let (from_secs, to_secs) = (to_epoch(from), to_epoch(to));
        let range = params![tenant_id, from_secs, to_secs];
        let (total, first, multiple, avg, successful): (i64, i64, i64, Option<f64>, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(rl.attempt_number = 1), 0),
                    COALESCE(SUM(rl.attempt_number > 1), 0),
                    AVG(rl.attempt_number),
                    COALESCE(SUM(l.status IN ('contacted', 'interested')), 0)
             FROM reuse_log rl JOIN lead l ON l.lead_id = rl.lead_id
             WHERE rl.tenant_id = ?1 AND rl.created_at BETWEEN ?2 AND ?3",
            range,
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let by_attempt = {
            let mut stmt = self.conn.prepare(
                "SELECT rl.attempt_number, COUNT(*),
                        COALESCE(SUM(l.status IN ('contacted', 'interested')), 0)
                 FROM reuse_log rl JOIN lead l ON l.lead_id = rl.lead_id
                 WHERE rl.tenant_id = ?1 AND rl.created_at BETWEEN ?2 AND ?3
                 GROUP BY rl.attempt_number ORDER BY rl.attempt_number",
            )?;
            let rows = stmt.query_map(range, |row| {
                let attempts: i64 = row.get(1)?;
                let successes: i64 = row.get(2)?;
                Ok(AttemptEffectiveness {
                    attempt_number: row.get::<_, i64>(0)? as u32,
                    total_attempts: attempts as u64,
                    successful:     successes as u64,
                    success_rate:   percent(successes, attempts),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let recent_activity = {
            let mut stmt = self.conn.prepare(
                "SELECT date(rl.created_at, 'unixepoch'), COUNT(*),
                        COALESCE(SUM(rl.reuse_reason = 'automatic_reuse'), 0),
                        COALESCE(SUM(rl.reuse_reason = 'manual_reuse'), 0)
                 FROM reuse_log rl
                 WHERE rl.tenant_id = ?1 AND rl.created_at BETWEEN ?2 AND ?3
                 GROUP BY 1 ORDER BY 1 DESC LIMIT 30",
            )?;
            let rows = stmt.query_map(range, |row| {
                Ok(DailyReuseActivity {
                    day:       row.get(0)?,
                    reuses:    row.get::<_, i64>(1)? as u64,
                    automatic: row.get::<_, i64>(2)? as u64,
                    manual:    row.get::<_, i64>(3)? as u64,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(ReuseMetrics {
            from,
            to,
            total_reuses:             total as u64,
            first_time_reuses:        first as u64,
            multiple_reuses:          multiple as u64,
            avg_reuse_attempt:        avg.map_or(0.0, |a| (a * 100.0).round() / 100.0),
            successful_reuses:        successful as u64,
            success_rate:             percent(successful, total),
            effectiveness_by_attempt: by_attempt,
            recent_activity,
        })
    }
}

/// Percentage rounded to two decimals.
fn percent(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 10_000.0).round() / 100.0
}
