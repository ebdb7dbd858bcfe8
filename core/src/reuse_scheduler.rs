//! Reuse Scheduler — returns unreached leads to the pool after a cooldown.
//!
//! Each lead is recycled in its own write transaction: eligibility is
//! re-checked, an agent is picked, and the lead, ledger, load counter and
//! reuse log all move together. A scan result is only a hint; the
//! transaction decides.

use crate::{
    agent::{Agent, CreditGate, Unmetered},
    assignment::Assignment,
    assignment_manager::distinct_ids,
    auth::Actor,
    clock::Clock,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    lead::Lead,
    reuse_policy::{LastCall, ReusePolicy, ReuseSkip},
    store::EngineStore,
    sweep::{Sweep, SweepSummary},
    types::{check_page_size, AgentId, AssignmentId, LeadId, Page, Timestamp},
};
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;

/// Default look-back for reuse metrics.
pub const METRICS_DEFAULT_DAYS: i64 = 30;

/// A lead the rule would recycle right now.
#[derive(Debug, Clone, Serialize)]
pub struct ReuseCandidate {
    pub lead:      Lead,
    pub last_call: LastCall,
}

/// A completed recycle.
#[derive(Debug, Clone, Serialize)]
pub struct ReusedLead {
    pub lead_id:    LeadId,
    pub agent_id:   AgentId,
    pub agent_name: String,
    pub attempt:    u32,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReuseOutcome {
    Reused {
        assignment_id: AssignmentId,
        agent_id:      AgentId,
        agent_name:    String,
        attempt:       u32,
    },
    /// Eligible, but nobody could take it.
    Failed { reason: ReuseSkip },
    /// No longer eligible by the time its turn came.
    Skipped { reason: ReuseSkip },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReuseResult {
    pub lead_id: LeadId,
    #[serde(flatten)]
    pub outcome: ReuseOutcome,
}

impl ReuseResult {
    fn from_attempt(lead_id: &str, attempt: Result<ReusedLead, ReuseSkip>) -> Self {
        let outcome = match attempt {
            Ok(r) => ReuseOutcome::Reused {
                assignment_id: r.assignment.assignment_id,
                agent_id:      r.agent_id,
                agent_name:    r.agent_name,
                attempt:       r.attempt,
            },
            Err(reason @ ReuseSkip::NoAvailableAgent) => ReuseOutcome::Failed { reason },
            Err(reason) => ReuseOutcome::Skipped { reason },
        };
        Self { lead_id: lead_id.to_string(), outcome }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self.outcome, ReuseOutcome::Reused { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ran,
    Disabled,
    OutsideWindow,
}

/// Summary of one automatic (or operator-triggered) run.
#[derive(Debug, Clone, Serialize)]
pub struct ReuseReport {
    pub tenant_id:  String,
    pub status:     RunStatus,
    pub candidates: u32,
    pub processed:  u32,
    pub failed:     u32,
    pub skipped:    u32,
    pub results:    Vec<ReuseResult>,
}

impl ReuseReport {
    fn idle(tenant_id: &str, status: RunStatus) -> Self {
        Self {
            tenant_id:  tenant_id.to_string(),
            status,
            candidates: 0,
            processed:  0,
            failed:     0,
            skipped:    0,
            results:    Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualReuseReport {
    pub total:      u32,
    pub successful: u32,
    pub failed:     u32,
    pub results:    Vec<ReuseResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReuseLogEntry {
    pub id:                     i64,
    pub lead_id:                LeadId,
    pub original_call_id:       Option<String>,
    pub original_assignment_id: Option<AssignmentId>,
    pub new_assignment_id:      AssignmentId,
    pub reuse_reason:           String,
    pub reassigned_to:          AgentId,
    pub attempt_number:         u32,
    pub created_at:             Timestamp,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AttemptEffectiveness {
    pub attempt_number: u32,
    pub total_attempts: u64,
    pub successful:     u64,
    pub success_rate:   f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailyReuseActivity {
    /// YYYY-MM-DD, UTC.
    pub day:       String,
    pub reuses:    u64,
    pub automatic: u64,
    pub manual:    u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReuseMetrics {
    pub from:                     Timestamp,
    pub to:                       Timestamp,
    pub total_reuses:             u64,
    pub first_time_reuses:        u64,
    pub multiple_reuses:          u64,
    pub avg_reuse_attempt:        f64,
    /// Recycled leads now contacted or interested.
    pub successful_reuses:        u64,
    pub success_rate:             f64,
    pub effectiveness_by_attempt: Vec<AttemptEffectiveness>,
    pub recent_activity:          Vec<DailyReuseActivity>,
}

#[derive(Clone)]
pub struct ReuseScheduler {
    config: EngineConfig,
    clock:  Arc<dyn Clock>,
    gate:   Arc<dyn CreditGate>,
}

impl ReuseScheduler {
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

    // ── Settings ───────────────────────────────────────────────

    pub fn get_reuse_settings(&self, store: &EngineStore, actor: &Actor) -> EngineResult<ReusePolicy> {
        actor.require_supervisor()?;
        self.policy(store, &actor.tenant_id)
    }

    pub fn update_reuse_settings(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        policy: &ReusePolicy,
    ) -> EngineResult<ReusePolicy> {
        actor.require_supervisor()?;
        policy.validate()?;
        store.save_reuse_policy(&actor.tenant_id, policy, &actor.user_id, self.clock.now())?;
        log::info!(
            "reuse policy for {} updated by {}: enabled={}, attempts={}, delay={}h",
            actor.tenant_id,
            actor.user_id,
            policy.auto_reuse_enabled,
            policy.max_reuse_attempts,
            policy.reuse_delay_hours
        );
        self.policy(store, &actor.tenant_id)
    }

    fn policy(&self, store: &EngineStore, tenant_id: &str) -> EngineResult<ReusePolicy> {
        store.reuse_policy(tenant_id, &self.config.default_policy, self.clock.now())
    }

    // ── Eligibility ────────────────────────────────────────────

    /// Leads the policy would recycle now, oldest outcome first, at most
    /// one batch.
    pub fn find_eligible_leads(
        &self,
        store: &EngineStore,
        tenant_id: &str,
        policy: &ReusePolicy,
    ) -> EngineResult<Vec<ReuseCandidate>> {
        store.reuse_candidates(
            tenant_id,
            &policy.rule(),
            self.clock.now(),
            self.config.reuse_batch_size,
            0,
        )
    }

    /// Read-only preview of what the next run would pick up.
    pub fn list_unpicked_leads(
        &self,
        store: &EngineStore,
        actor: &Actor,
        limit: u32,
        offset: u32,
    ) -> EngineResult<Page<ReuseCandidate>> {
        actor.require_supervisor()?;
        check_page_size(limit)?;
        let rule = self.policy(store, &actor.tenant_id)?.rule();
        let now = self.clock.now();
        let items = store.reuse_candidates(&actor.tenant_id, &rule, now, limit, offset)?;
        let total = store.count_reuse_candidates(&actor.tenant_id, &rule, now)?;
        Ok(Page::new(items, total, limit, offset))
    }

    /// Least-loaded active, available agent the credit gate accepts.
    pub fn select_agent(&self, store: &EngineStore, tenant_id: &str) -> EngineResult<Option<Agent>> {
        store.least_loaded_agent(tenant_id, self.gate.as_ref())
    }

    // ── Runs ───────────────────────────────────────────────────

    /// The timer-driven run. A disabled policy or a closed window is a no-op.
    pub fn process_unpicked_leads(&self, store: &mut EngineStore, tenant_id: &str) -> EngineResult<ReuseReport> {
        let policy = self.policy(store, tenant_id)?;
        if !policy.auto_reuse_enabled {
            log::debug!("reuse disabled for {tenant_id}; skipping");
            return Ok(ReuseReport::idle(tenant_id, RunStatus::Disabled));
        }
        if !policy.window_allows(self.clock.now()) {
            log::debug!("outside reuse window for {tenant_id}; skipping");
            return Ok(ReuseReport::idle(tenant_id, RunStatus::OutsideWindow));
        }
        self.run_batch(store, tenant_id, &policy)
    }

    /// Operator-triggered run. Ignores the window, refuses when reuse is off.
    pub fn process_now(&self, store: &mut EngineStore, actor: &Actor) -> EngineResult<ReuseReport> {
        actor.require_supervisor()?;
        let policy = self.policy(store, &actor.tenant_id)?;
        if !policy.auto_reuse_enabled {
            return Err(EngineError::PolicyDisabled { tenant_id: actor.tenant_id.clone() });
        }
        self.run_batch(store, &actor.tenant_id, &policy)
    }

    fn run_batch(&self, store: &mut EngineStore, tenant_id: &str, policy: &ReusePolicy) -> EngineResult<ReuseReport> {
        let candidates = self.find_eligible_leads(store, tenant_id, policy)?;
        let rule = policy.rule();
        let mut report = ReuseReport::idle(tenant_id, RunStatus::Ran);
        report.candidates = candidates.len() as u32;

        for candidate in &candidates {
            let lead_id = &candidate.lead.lead_id;
            let now = self.clock.now();
            let attempt = store.reuse_lead(
                tenant_id,
                lead_id,
                &rule,
                false,
                self.gate.as_ref(),
                now + self.config.assignment_ttl(),
                now,
            )?;
            let result = ReuseResult::from_attempt(lead_id, attempt);
            match &result.outcome {
                ReuseOutcome::Reused { agent_id, attempt, .. } => {
                    report.processed += 1;
                    log::debug!("lead {lead_id} recycled to {agent_id} (attempt {attempt})");
                }
                ReuseOutcome::Failed { reason } => {
                    report.failed += 1;
                    log::warn!("lead {lead_id} not recycled: {reason}");
                }
                ReuseOutcome::Skipped { reason } => {
                    report.skipped += 1;
                    log::debug!("lead {lead_id} skipped: {reason}");
                }
            }
            report.results.push(result);
        }

        log::info!(
            "reuse run for {tenant_id}: {} candidates, {} recycled, {} failed, {} skipped",
            report.candidates,
            report.processed,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    /// Recycle specific leads now, outside the schedule. Attempts, cooldown,
    /// triggers and open claims are still enforced.
    pub fn trigger_manual_reuse(
        &self,
        store: &mut EngineStore,
        actor: &Actor,
        lead_ids: &[String],
    ) -> EngineResult<ManualReuseReport> {
        actor.require_supervisor()?;
        let lead_ids = distinct_ids("lead_ids", lead_ids, self.config.max_manual_reuse)?;
        let rule = self.policy(store, &actor.tenant_id)?.rule();

        let mut report = ManualReuseReport {
            total:      lead_ids.len() as u32,
            successful: 0,
            failed:     0,
            results:    Vec::with_capacity(lead_ids.len()),
        };
        for lead_id in &lead_ids {
            let now = self.clock.now();
            let attempt = store.reuse_lead(
                &actor.tenant_id,
                lead_id,
                &rule,
                true,
                self.gate.as_ref(),
                now + self.config.assignment_ttl(),
                now,
            )?;
            let result = ReuseResult::from_attempt(lead_id, attempt);
            if result.is_reused() {
                report.successful += 1;
            } else {
                report.failed += 1;
            }
            report.results.push(result);
        }

        log::info!(
            "manual reuse by {}: {}/{} recycled",
            actor.user_id,
            report.successful,
            report.total
        );
        Ok(report)
    }

    // ── Metrics ────────────────────────────────────────────────

    /// Recycling effectiveness over `range`, default the last 30 days.
    pub fn reuse_metrics(
        &self,
        store: &EngineStore,
        actor: &Actor,
        range: Option<(Timestamp, Timestamp)>,
    ) -> EngineResult<ReuseMetrics> {
        actor.require_supervisor()?;
        let (from, to) = match range {
            Some((from, to)) if from > to => {
                return Err(EngineError::validation("range", "start must not be after end"));
            }
            Some(r) => r,
            None => {
                let now = self.clock.now();
                (now - Duration::days(METRICS_DEFAULT_DAYS), now)
            }
        };
        store.reuse_metrics(&actor.tenant_id, from, to)
    }
}

impl Sweep for ReuseScheduler {
    fn name(&self) -> &'static str {
        "reuse_scheduler"
    }

    fn run(&mut self, store: &mut EngineStore, tenant_id: &str) -> EngineResult<SweepSummary> {
        let report = self.process_unpicked_leads(store, tenant_id)?;
        let mut summary = SweepSummary::new(self.name(), tenant_id);
        summary.processed = report.processed;
        summary.failed = report.failed;
        summary.skipped = report.skipped;
        summary.note = match report.status {
            RunStatus::Ran => None,
            RunStatus::Disabled => Some("auto reuse disabled".to_string()),
            RunStatus::OutsideWindow => Some("outside reuse window".to_string()),
        };
        Ok(summary)
    }
}
