//! Assignment Manager — creates, transitions and reports on claims.
//!
//! RULE: the manager validates and authorizes; the store does every
//! read-then-write under one write lock. Nothing here caches ledger state.

use crate::{
    agent::{CreditGate, LoadDrift, Unmetered},
    assignment::{
        AssignBatch, AssignedBy, Assignment, AssignmentQuery, AssignmentStats, AssignmentStatus,
        BulkAssignResult, NewAssignment, StatsPeriod,
    },
    auth::Actor,
    clock::Clock,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    lead::{CallOutcome, LeadFilters},
    store::EngineStore,
    types::{check_page_size, Page, Timestamp},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AssignmentManager {
    config: EngineConfig,
    clock:  Arc<dyn Clock>,
    gate:   Arc<dyn CreditGate>,
}

impl AssignmentManager {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            gate: Arc::new(Unmetered),
        }
    }

    pub fn with_credit_gate(mut self, gate: Arc<dyn CreditGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Create ─────────────────────────────────────────────────

    /// Claim one lead for one agent.
    pub fn create_assignment(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        lead_id: &str,
        agent_id: &str,
        expires_at: Option<Timestamp>,
    ) -> EngineResult<Assignment> {
        actor.require_assigner()?;
        require_id("lead_id", lead_id)?;
        require_id("agent_id", agent_id)?;
        let now = self.clock.now();
        let expires_at = self.expiry(expires_at, now)?;
        self.check_credit(&actor.tenant_id, agent_id)?;

        let new = NewAssignment {
            tenant_id:   actor.tenant_id.clone(),
            lead_id:     lead_id.to_string(),
            agent_id:    agent_id.to_string(),
            assigned_by: AssignedBy::Operator(actor.user_id.clone()),
            expires_at,
        };
        match store.create_assignment(&new, now) {
            Ok(assignment) => {
                log::info!(
                    "assignment {} created: lead {lead_id} -> agent {agent_id} by {}",
                    assignment.assignment_id,
                    actor.user_id
                );
                Ok(assignment)
            }
            Err(e) => {
                if let EngineError::Conflict { .. } = e {
                    log::warn!("assignment of lead {lead_id} rejected: {e}");
                }
                Err(e)
            }
        }
    }

    /// Claim a list of leads for one agent. Leads someone else holds are
    /// reported back; the rest are assigned. Fails only if all are held.
    pub fn assign_leads(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        lead_ids: &[String],
        agent_id: &str,
        expires_at: Option<Timestamp>,
    ) -> EngineResult<AssignBatch> {
        actor.require_assigner()?;
        require_id("agent_id", agent_id)?;
        let lead_ids = distinct_ids("lead_ids", lead_ids, self.config.max_leads_per_assign)?;
        let now = self.clock.now();
        let expires_at = self.expiry(expires_at, now)?;
        self.check_credit(&actor.tenant_id, agent_id)?;

        let assigned_by = AssignedBy::Operator(actor.user_id.clone());
        let batch = store.assign_leads(&actor.tenant_id, &lead_ids, agent_id, &assigned_by, expires_at, now)?;

        if batch.assignments.is_empty() && !batch.conflicts.is_empty() {
            log::warn!("all {} leads already assigned; nothing given to {agent_id}", lead_ids.len());
            return Err(EngineError::Conflict { conflicts: batch.conflicts });
        }
        log::info!(
            "assigned {} lead(s) to {agent_id}, {} already held",
            batch.assignments.len(),
            batch.conflicts.len()
        );
        Ok(batch)
    }

    /// Give an agent up to `count` unheld leads matching `filters`, oldest first.
    pub fn bulk_assign(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        agent_id: &str,
        count: u32,
        filters: &LeadFilters,
    ) -> EngineResult<BulkAssignResult> {
        actor.require_assigner()?;
        require_id("agent_id", agent_id)?;
        if !(1..=self.config.max_bulk_count).contains(&count) {
            return Err(EngineError::validation(
                "count",
                format!("must be between 1 and {}", self.config.max_bulk_count),
            ));
        }
        if let Some(status) = filters.status {
            if !status.is_assignable() {
                return Err(EngineError::validation(
                    "filters.status",
                    format!("'{}' leads cannot be bulk assigned", status.as_str()),
                ));
            }
        }
        let now = self.clock.now();
        let expires_at = now + self.config.assignment_ttl();
        self.check_credit(&actor.tenant_id, agent_id)?;

        let assigned_by = AssignedBy::Operator(actor.user_id.clone());
        let assignments =
            store.bulk_claim(&actor.tenant_id, agent_id, count, filters, &assigned_by, expires_at, now)?;
        if assignments.is_empty() {
            return Err(EngineError::not_found("eligible leads", describe_filters(filters)));
        }

        log::info!("bulk assigned {}/{count} lead(s) to {agent_id}", assignments.len());
        Ok(BulkAssignResult {
            agent_id:          agent_id.to_string(),
            requested_count:   count,
            assigned_lead_ids: assignments.iter().map(|a| a.lead_id.clone()).collect(),
            assignments,
        })
    }

    // ── Transition ─────────────────────────────────────────────

    pub fn update_status(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        assignment_id: &str,
        status: AssignmentStatus,
    ) -> EngineResult<Assignment> {
        let current = self.load_for_work(store, actor, assignment_id, status)?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from: current.status, to: status });
        }

        let now = self.clock.now();
        match store.transition_assignment(&actor.tenant_id, assignment_id, current.status, status, &actor.user_id, now)? {
            Some(updated) => {
                log::info!("assignment {assignment_id}: {} -> {status}", current.status);
                Ok(updated)
            }
            None => Err(self.lost_race(store, actor, assignment_id, status)?),
        }
    }

    /// Close an assignment with the outcome of its call.
    pub fn record_outcome(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        assignment_id: &str,
        outcome: CallOutcome,
    ) -> EngineResult<Assignment> {
        let current = self.load_for_work(store, actor, assignment_id, AssignmentStatus::Completed)?;
        if !current.status.can_transition_to(AssignmentStatus::Completed) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to:   AssignmentStatus::Completed,
            });
        }

        let now = self.clock.now();
        match store.complete_with_outcome(&actor.tenant_id, assignment_id, current.status, outcome, &actor.user_id, now)? {
            Some((updated, call)) => {
                log::info!(
                    "assignment {assignment_id} completed with {} (call {})",
                    outcome.as_str(),
                    call.call_id
                );
                Ok(updated)
            }
            None => Err(self.lost_race(store, actor, assignment_id, AssignmentStatus::Completed)?),
        }
    }

    /// Fetch an assignment the caller may work. One past its deadline is
    /// expired here rather than left for the reaper.
    fn load_for_work(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        assignment_id: &str,
        to: AssignmentStatus,
    ) -> EngineResult<Assignment> {
        require_id("assignment_id", assignment_id)?;
        let current = store
            .get_assignment(&actor.tenant_id, assignment_id)?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        actor.require_can_work(&current.agent_id)?;
        if current.is_stale(self.clock.now()) {
            return Err(self.lost_race(store, actor, assignment_id, to)?);
        }
        Ok(current)
    }

    /// The row moved, or lapsed, between our read and our write.
    fn lost_race(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        assignment_id: &str,
        to: AssignmentStatus,
    ) -> EngineResult<EngineError> {
        let now = self.clock.now();
        if let Some(expired) = store.expire_assignment(&actor.tenant_id, assignment_id, now)? {
            log::info!(
                "assignment {assignment_id} lapsed at {}; expired ahead of the reaper",
                expired.expires_at
            );
        }
        let latest = store
            .get_assignment(&actor.tenant_id, assignment_id)?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        Ok(EngineError::InvalidTransition { from: latest.status, to })
    }

    // ── Read ───────────────────────────────────────────────────

    pub fn get_assignment(&self, store: &EngineStore, actor: &Actor, assignment_id: &str) -> EngineResult<Assignment> {
        store
            .get_assignment(&actor.tenant_id, assignment_id)?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))
    }

    pub fn list_assignments(
        &self,
        store: &EngineStore,
        actor: &Actor,
        query: &AssignmentQuery,
    ) -> EngineResult<Page<Assignment>> {
        check_page_size(query.limit)?;
        store.list_assignments(&actor.tenant_id, query)
    }

    /// The caller's own worklist.
    pub fn my_leads(
        &self,
        store: &EngineStore,
        actor: &Actor,
        status: Option<AssignmentStatus>,
        limit: u32,
        offset: u32,
    ) -> EngineResult<Page<Assignment>> {
        actor.require_worker()?;
        check_page_size(limit)?;
        store.assignments_for_agent(&actor.tenant_id, &actor.user_id, status, limit, offset)
    }

    pub fn assignment_stats(
        &self,
        store: &EngineStore,
        actor: &Actor,
        period: StatsPeriod,
    ) -> EngineResult<AssignmentStats> {
        store.assignment_stats(&actor.tenant_id, period.since(self.clock.now()))
    }

    // ── Repair ─────────────────────────────────────────────────

    /// Recount open assignments per agent from the ledger.
    pub fn rebuild_load_index(&self, store: &mut EngineStore, actor: &Actor) -> EngineResult<Vec<LoadDrift>> {
        actor.require_supervisor()?;
        let drift = store.rebuild_load_index(&actor.tenant_id, &actor.user_id, self.clock.now())?;
        for d in &drift {
            log::warn!(
                "load index drift for agent {}: recorded {}, ledger {}",
                d.agent_id,
                d.recorded,
                d.actual
            );
        }
        Ok(drift)
    }

    // ── Helpers ────────────────────────────────────────────────

    fn expiry(&self, requested: Option<Timestamp>, now: Timestamp) -> EngineResult<Timestamp> {
        match requested {
            Some(at) if at <= now => Err(EngineError::validation("expires_at", "must be in the future")),
            Some(at) => Ok(at),
            None => Ok(now + self.config.assignment_ttl()),
        }
    }

    fn check_credit(&self, tenant_id: &str, agent_id: &str) -> EngineResult<()> {
        if self.gate.may_assign(tenant_id, agent_id)? {
            Ok(())
        } else {
            log::warn!("credit gate refused assignment to agent {agent_id}");
            Err(EngineError::NoCapacity { tenant_id: tenant_id.to_string() })
        }
    }
}

fn require_id(field: &'static str, id: &str) -> EngineResult<()> {
    if id.trim().is_empty() {
        Err(EngineError::validation(field, "must not be empty"))
    } else {
        Ok(())
    }
}

/// Non-empty, bounded, duplicates dropped in first-seen order.
pub(crate) fn distinct_ids(field: &'static str, ids: &[String], max: u32) -> EngineResult<Vec<String>> {
    if ids.is_empty() {
        return Err(EngineError::validation(field, "at least one id is required"));
    }
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(EngineError::validation(field, "ids must not be empty"));
    }
    let mut seen = std::collections::HashSet::new();
    let distinct: Vec<String> = ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect();
    if distinct.len() > max as usize {
        return Err(EngineError::validation(field, format!("at most {max} ids per request")));
    }
    Ok(distinct)
}

fn describe_filters(f: &LeadFilters) -> String {
    let mut parts = Vec::new();
    if let Some(c) = &f.campaign_id {
        parts.push(format!("campaign={c}"));
    }
    if let Some(s) = f.status {
        parts.push(format!("status={}", s.as_str()));
    }
    if let Some(i) = &f.industry {
        parts.push(format!("industry={i}"));
    }
    if let Some(l) = &f.location {
        parts.push(format!("location~{l}"));
    }
    if parts.is_empty() {
        "no filters".to_string()
    } else {
        parts.join(", ")
    }
}
