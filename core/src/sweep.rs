//! Sweep trait.
//!
//! RULE: Every timer-driven job implements Sweep.
//! The engine calls run() on each registered sweep, for each tenant,
//! in registration order, every tick.
//! Execution order is fixed and documented in engine.rs.

use crate::{error::EngineResult, store::EngineStore};
use serde::Serialize;

/// The contract every background job must fulfill.
pub trait Sweep: Send {
    /// Unique stable name for this sweep.
    fn name(&self) -> &'static str;

    /// One pass over one tenant.
    ///
    /// Business-level misses (no agent, lead already taken) are counted in
    /// the summary. Only infrastructure failures come back as `Err`.
    fn run(&mut self, store: &mut EngineStore, tenant_id: &str) -> EngineResult<SweepSummary>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SweepSummary {
    pub sweep:     &'static str,
    pub tenant_id: String,
    pub processed: u32,
    pub failed:    u32,
    pub skipped:   u32,
    pub note:      Option<String>,
}

impl SweepSummary {
    pub fn new(sweep: &'static str, tenant_id: &str) -> Self {
        Self {
            sweep,
            tenant_id: tenant_id.to_string(),
            processed: 0,
            failed:    0,
            skipped:   0,
            note:      None,
        }
    }
}
