//! The sweep engine — drives the timer-based background jobs.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Expiry reaper     (frees stale claims and their load)
//!   2. Reuse scheduler   (recycles unreached leads)
//!
//! RULES:
//!   - Sweeps run in registration order, for every tenant, every tick.
//!   - A sweep failing for one tenant does not stop the others; it is
//!     logged and retried on the next tick.
//!   - The engine holds its own store connection. Request handlers hold
//!     theirs; all coordination happens in the database.

use crate::{
    agent::CreditGate,
    clock::Clock,
    config::EngineConfig,
    error::EngineResult,
    reaper::ExpiryReaper,
    reuse_scheduler::ReuseScheduler,
    store::EngineStore,
    sweep::{Sweep, SweepSummary},
    types::Timestamp,
};
use serde::Serialize;
use std::{
    sync::{mpsc::{Receiver, RecvTimeoutError}, Arc},
    time::Duration,
};

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub sweep:          &'static str,
    pub tenant_id:      String,
    pub error:          String,
    /// Storage or encoding failure; the run is retried on the next tick.
    pub infrastructure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick:       u64,
    pub started_at: Timestamp,
    pub tenants:    usize,
    pub summaries:  Vec<SweepSummary>,
    pub failures:   Vec<SweepFailure>,
}

impl TickReport {
    pub fn total_processed(&self, sweep: &str) -> u32 {
        self.summaries
            .iter()
            .filter(|s| s.sweep == sweep)
            .map(|s| s.processed)
            .sum()
    }
}

pub struct SweepEngine {
    store:  EngineStore,
    clock:  Arc<dyn Clock>,
    sweeps: Vec<Box<dyn Sweep>>,
    ticks:  u64,
}

impl SweepEngine {
    pub fn new(store: EngineStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            sweeps: Vec::new(),
            ticks:  0,
        }
    }

    /// Build a fully wired engine with both sweeps registered.
    /// Call this instead of new() + manual register() calls.
    pub fn build(
        store: EngineStore,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
        gate: Arc<dyn CreditGate>,
    ) -> Self {
        let mut engine = SweepEngine::new(store, clock.clone());

        // EXECUTION ORDER: reaper before scheduler. Append only.
        engine.register(Box::new(ExpiryReaper::new(config, clock.clone())));
        engine.register(Box::new(
            ReuseScheduler::new(config.clone(), clock).with_credit_gate(gate),
        ));
        engine
    }

    /// Register a sweep. Call in the documented execution order.
    pub fn register(&mut self, sweep: Box<dyn Sweep>) {
        self.sweeps.push(sweep);
    }

    pub fn sweep_names(&self) -> Vec<&'static str> {
        self.sweeps.iter().map(|s| s.name()).collect()
    }

    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// One pass of every sweep over every tenant.
    /// Fails only if the tenant list itself cannot be read.
    pub fn tick(&mut self) -> EngineResult<TickReport> {
        self.ticks += 1;
        let started_at = self.clock.now();
        let tenants = self.store.tenants()?;

        let mut report = TickReport {
            tick: self.ticks,
            started_at,
            tenants: tenants.len(),
            summaries: Vec::new(),
            failures: Vec::new(),
        };

        for tenant_id in &tenants {
            for sweep in &mut self.sweeps {
                match sweep.run(&mut self.store, tenant_id) {
                    Ok(summary) => report.summaries.push(summary),
                    Err(e) => {
                        let infrastructure = e.is_infrastructure();
                        if infrastructure {
                            log::error!("{} failed for tenant {tenant_id}, retrying next tick: {e}", sweep.name());
                        } else {
                            log::warn!("{} refused for tenant {tenant_id}: {e}", sweep.name());
                        }
                        report.failures.push(SweepFailure {
                            sweep:          sweep.name(),
                            tenant_id:      tenant_id.clone(),
                            error:          e.to_string(),
                            infrastructure,
                        });
                    }
                }
            }
        }

        log::debug!(
            "tick {} done: {} tenant(s), {} summary(ies), {} failure(s)",
            report.tick,
            report.tenants,
            report.summaries.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Tick every `interval` until `shutdown` fires or its sender is dropped.
    /// Returns the number of ticks run.
    pub fn run(&mut self, interval: Duration, shutdown: &Receiver<()>) -> u64 {
        let mut ran = 0;
        loop {
            match self.tick() {
                Ok(_) => ran += 1,
                Err(e) => log::error!("tick {} aborted: {e}", self.ticks),
            }
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("sweep engine stopped after {ran} tick(s)");
        ran
    }
}
