//! Expiry reaper — enforces `expires_at`.
//!
//! Stale open assignments are moved to `expired`, which frees the lead for
//! reassignment and the agent's load slot in the same transaction.

use crate::{
    assignment::Assignment,
    clock::Clock,
    config::EngineConfig,
    error::EngineResult,
    store::EngineStore,
    sweep::{Sweep, SweepSummary},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ExpiryReaper {
    batch_size: u32,
    clock:      Arc<dyn Clock>,
}

impl ExpiryReaper {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            batch_size: config.expiry_batch_size.max(1),
            clock,
        }
    }

    /// Expire one batch of stale assignments for a tenant.
    pub fn reap(&self, store: &mut EngineStore, tenant_id: &str) -> EngineResult<Vec<Assignment>> {
        let expired = store.expire_stale(tenant_id, self.clock.now(), self.batch_size)?;
        if !expired.is_empty() {
            log::info!("expired {} stale assignment(s) in {tenant_id}", expired.len());
        }
        Ok(expired)
    }
}

impl Sweep for ExpiryReaper {
    fn name(&self) -> &'static str {
        "expiry_reaper"
    }

    fn run(&mut self, store: &mut EngineStore, tenant_id: &str) -> EngineResult<SweepSummary> {
        let expired = self.reap(store, tenant_id)?;
        let mut summary = SweepSummary::new(self.name(), tenant_id);
        summary.processed = expired.len() as u32;
        Ok(summary)
    }
}
