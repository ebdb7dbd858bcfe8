//! Shared fixture for the integration tests: a migrated store, a pinned
//! clock and the two request-side components wired to it.
#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use dialer_core::{
    agent::Agent,
    assignment::Assignment,
    assignment_manager::AssignmentManager,
    auth::{Actor, Role},
    clock::{Clock, ManualClock},
    config::EngineConfig,
    lead::{CallOutcome, CallRecord, NewLead},
    reuse_scheduler::ReuseScheduler,
    store::EngineStore,
    types::Timestamp,
};
use std::sync::Arc;

pub const TENANT: &str = "acme";
pub const OTHER_TENANT: &str = "globex";

/// Wednesday 2024-03-06 12:00 UTC, inside the default business-hours window.
pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap()
}

pub fn admin() -> Actor {
    Actor::new("admin-1", TENANT, Role::Admin)
}

pub fn manager() -> Actor {
    Actor::new("mgr-1", TENANT, Role::Manager)
}

pub fn agent_actor(agent_id: &str) -> Actor {
    Actor::new(agent_id, TENANT, Role::Agent)
}

pub struct Fixture {
    pub store:     EngineStore,
    pub clock:     ManualClock,
    pub config:    EngineConfig,
    pub manager:   AssignmentManager,
    pub scheduler: ReuseScheduler,
    calls:         u32,
}

impl Fixture {
    pub fn new() -> Self {
        let store = EngineStore::in_memory().unwrap();
        store.migrate().unwrap();
        Self::with_store(store)
    }

    pub fn with_store(store: EngineStore) -> Self {
        let clock = ManualClock::new(t0());
        let config = EngineConfig::default();
        Self {
            manager:   AssignmentManager::new(config.clone(), Arc::new(clock.clone())),
            scheduler: ReuseScheduler::new(config.clone(), Arc::new(clock.clone())),
            store,
            clock,
            config,
            calls: 0,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn agent(&self, agent_id: &str) -> Agent {
        let agent = Agent::new(agent_id, TENANT, &format!("Agent {agent_id}"));
        self.store.upsert_agent(&agent).unwrap();
        agent
    }

    /// A lead created `age_days` before the fixture's start time.
    pub fn lead_aged(&self, lead_id: &str, age_days: i64) {
        let lead = NewLead::new(lead_id, "Pat", lead_id, "+15550100");
        self.store
            .insert_lead(TENANT, &lead, t0() - Duration::days(age_days))
            .unwrap();
    }

    pub fn lead(&self, lead_id: &str) {
        self.lead_aged(lead_id, 1);
    }

    /// An outcome from the call feed, not tied to any assignment.
    pub fn call(&mut self, lead_id: &str, outcome: CallOutcome, at: Timestamp) -> String {
        self.calls += 1;
        let call_id = format!("call-{}", self.calls);
        self.store
            .record_call_outcome(
                TENANT,
                &CallRecord {
                    call_id:       call_id.clone(),
                    lead_id:       lead_id.to_string(),
                    agent_id:      None,
                    assignment_id: None,
                    outcome,
                    occurred_at:   at,
                },
            )
            .unwrap();
        call_id
    }

    pub fn assign(&mut self, lead_id: &str, agent_id: &str) -> Assignment {
        self.manager
            .create_assignment(&mut self.store, &admin(), lead_id, agent_id, None)
            .unwrap()
    }

    pub fn load_of(&self, agent_id: &str) -> u32 {
        self.store.get_agent(TENANT, agent_id).unwrap().unwrap().open_assignments
    }

    /// Turn off the schedule window so reuse runs at any hour.
    pub fn without_window(&mut self) {
        let mut policy = self.scheduler.get_reuse_settings(&self.store, &admin()).unwrap();
        policy.time_window = None;
        self.scheduler
            .update_reuse_settings(&mut self.store, &admin(), &policy)
            .unwrap();
    }
}

/// A fresh SQLite file in the temp dir, migrated. Removed by `cleanup`.
pub fn temp_db() -> String {
    let path = std::env::temp_dir().join(format!("dialer-core-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().into_owned();
    let store = EngineStore::open(&path).unwrap();
    store.migrate().unwrap();
    path
}

pub fn cleanup(path: &str) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
}
