//! Agent directory mirror and the Agent Load Index.

use super::{append_event, EngineStore, OPEN_STATUSES};
use crate::{
    agent::{Agent, CreditGate, LoadDrift},
    error::EngineResult,
    event::EngineEvent,
    types::Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension};

const AGENT_COLUMNS: &str =
    "agent_id, tenant_id, display_name, is_active, is_available, open_assignments";

fn agent_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        agent_id:         row.get(0)?,
        tenant_id:        row.get(1)?,
        display_name:     row.get(2)?,
        is_active:        row.get::<_, i32>(3)? != 0,
        is_available:     row.get::<_, i32>(4)? != 0,
        open_assignments: row.get::<_, i64>(5)? as u32,
    })
}

pub(crate) fn agent_in_tenant(
    conn: &Connection,
    tenant_id: &str,
    agent_id: &str,
) -> EngineResult<Option<Agent>> {
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agent WHERE tenant_id = ?1 AND agent_id = ?2");
    conn.query_row(&sql, params![tenant_id, agent_id], agent_row_mapper)
        .optional()
        .map_err(Into::into)
}

/// Least-loaded active, available agent, ties broken by agent id.
/// Agents the credit gate refuses are passed over.
pub(crate) fn pick_agent(
    conn: &Connection,
    tenant_id: &str,
    gate: &dyn CreditGate,
) -> EngineResult<Option<Agent>> {
    let sql = format!(
        "SELECT {AGENT_COLUMNS} FROM agent
         WHERE tenant_id = ?1 AND is_active = 1 AND is_available = 1
         ORDER BY open_assignments ASC, agent_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let candidates = stmt
        .query_map(params![tenant_id], agent_row_mapper)?
        .collect::<Result<Vec<_>, _>>()?;
    for agent in candidates {
        if gate.may_assign(tenant_id, &agent.agent_id)? {
            return Ok(Some(agent));
        }
        log::debug!("credit gate refused agent {} in tenant {tenant_id}", agent.agent_id);
    }
    Ok(None)
}

/// Shift an agent's open-assignment counter. Never drops below zero.
pub(crate) fn adjust_load(conn: &Connection, agent_id: &str, delta: i64) -> EngineResult<()> {
    conn.execute(
        "UPDATE agent SET open_assignments = MAX(open_assignments + ?1, 0) WHERE agent_id = ?2",
        params![delta, agent_id],
    )?;
    Ok(())
}

impl EngineStore {
    // ── Directory ──────────────────────────────────────────────

    /// Insert or refresh an agent from the directory. The load counter is
    /// owned by the ledger and is left untouched on refresh.
    pub fn upsert_agent(&self, a: &Agent) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO agent (agent_id, tenant_id, display_name, is_active, is_available, open_assignments)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(agent_id) DO UPDATE SET
                display_name = excluded.display_name,
                is_active    = excluded.is_active,
                is_available = excluded.is_available
             WHERE agent.tenant_id = excluded.tenant_id",
            params![
                &a.agent_id,
                &a.tenant_id,
                &a.display_name,
                a.is_active as i32,
                a.is_available as i32,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, tenant_id: &str, agent_id: &str) -> EngineResult<Option<Agent>> {
        agent_in_tenant(&self.conn, tenant_id, agent_id)
    }

    pub fn set_agent_availability(&self, tenant_id: &str, agent_id: &str, available: bool) -> EngineResult<bool> {
        let n = self.conn.execute(
            "UPDATE agent SET is_available = ?1 WHERE tenant_id = ?2 AND agent_id = ?3",
            params![available as i32, tenant_id, agent_id],
        )?;
        Ok(n > 0)
    }

    pub fn set_agent_active(&self, tenant_id: &str, agent_id: &str, active: bool) -> EngineResult<bool> {
        let n = self.conn.execute(
            "UPDATE agent SET is_active = ?1 WHERE tenant_id = ?2 AND agent_id = ?3",
            params![active as i32, tenant_id, agent_id],
        )?;
        Ok(n > 0)
    }

    // ── Load index ─────────────────────────────────────────────

    /// Every agent in the tenant, least loaded first.
    pub fn agent_load_index(&self, tenant_id: &str) -> EngineResult<Vec<Agent>> {
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agent WHERE tenant_id = ?1
             ORDER BY open_assignments ASC, agent_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let agents = stmt
            .query_map(params![tenant_id], agent_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn least_loaded_agent(&self, tenant_id: &str, gate: &dyn CreditGate) -> EngineResult<Option<Agent>> {
        pick_agent(&self.conn, tenant_id, gate)
    }

    /// Open assignments for an agent, counted from the ledger itself.
    pub fn ledger_load(&self, tenant_id: &str, agent_id: &str) -> EngineResult<u32> {
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM assignment
                 WHERE tenant_id = ?1 AND agent_id = ?2 AND status IN {OPEN_STATUSES}"
            ),
            params![tenant_id, agent_id],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    /// Recount every agent's load from the ledger and correct any drift.
    pub fn rebuild_load_index(
        &mut self,
        tenant_id: &str,
        actor: &str,
        now: Timestamp,
    ) -> EngineResult<Vec<LoadDrift>> {
        let tx = self.write_tx()?;
        let drift = {
            let mut stmt = tx.prepare(&format!(
                "SELECT ag.agent_id, ag.open_assignments,
                        (SELECT COUNT(*) FROM assignment a
                         WHERE a.agent_id = ag.agent_id AND a.status IN {OPEN_STATUSES})
                 FROM agent ag WHERE ag.tenant_id = ?1
                 ORDER BY ag.agent_id"
            ))?;
            let rows = stmt
                .query_map(params![tenant_id], |row| {
                    Ok(LoadDrift {
                        agent_id: row.get(0)?,
                        recorded: row.get::<_, i64>(1)? as u32,
                        actual:   row.get::<_, i64>(2)? as u32,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|d| d.recorded != d.actual)
                .collect::<Vec<_>>()
        };

        for d in &drift {
            tx.execute(
                "UPDATE agent SET open_assignments = ?1 WHERE agent_id = ?2",
                params![d.actual, &d.agent_id],
            )?;
            append_event(
                &tx,
                tenant_id,
                actor,
                now,
                &EngineEvent::LoadIndexRepaired {
                    agent_id: d.agent_id.clone(),
                    recorded: d.recorded,
                    actual:   d.actual,
                },
            )?;
        }
        tx.commit()?;
        Ok(drift)
    }

    /// Overwrite a counter without touching the ledger. Exists so repair
    /// paths can be exercised.
    #[doc(hidden)]
    pub fn force_load_counter(&self, agent_id: &str, value: u32) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE agent SET open_assignments = ?1 WHERE agent_id = ?2",
            params![value, agent_id],
        )?;
        Ok(())
    }
}
