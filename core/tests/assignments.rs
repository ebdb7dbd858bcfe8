//! Assignment Manager tests — claims, conflicts and the state machine.

mod common;

use chrono::Duration;
use common::{admin, agent_actor, manager, Fixture, OTHER_TENANT, TENANT};
use dialer_core::{
    agent::{Agent, CreditGate},
    assignment::{AssignedBy, AssignmentStatus},
    auth::{Actor, Role},
    error::{EngineError, EngineResult},
    lead::{CallOutcome, LeadStatus, NewLead},
};
use std::sync::Arc;

/// A never-assigned lead can be claimed once; a second claim names the holder.
#[test]
fn second_claim_on_a_lead_conflicts_and_names_the_holder() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.agent("agent-2");
    fx.lead("lead-x");

    let first = fx.assign("lead-x", "agent-1");
    assert_eq!(first.status, AssignmentStatus::Pending);
    assert_eq!(first.assigned_by, AssignedBy::Operator("admin-1".into()));
    assert_eq!(first.expires_at, fx.now() + Duration::hours(24));

    let err = fx
        .manager
        .create_assignment(&mut fx.store, &admin(), "lead-x", "agent-2", None)
        .unwrap_err();
    match err {
        EngineError::Conflict { conflicts } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].lead_id, "lead-x");
            assert_eq!(conflicts[0].held_by, "agent-1");
            assert_eq!(conflicts[0].held_by_name, "Agent agent-1");
            assert_eq!(conflicts[0].assignment_id, first.assignment_id);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-x").unwrap(), 1);
    assert_eq!(fx.load_of("agent-1"), 1);
    assert_eq!(fx.load_of("agent-2"), 0);
}

/// Unknown, inactive or foreign agents and leads are all NotFound.
#[test]
fn claims_require_tenant_owned_lead_and_active_agent() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");

    let mut retired = Agent::new("agent-retired", TENANT, "Retired");
    retired.is_active = false;
    fx.store.upsert_agent(&retired).unwrap();
    fx.store
        .upsert_agent(&Agent::new("agent-foreign", OTHER_TENANT, "Foreign"))
        .unwrap();
    fx.store
        .insert_lead(OTHER_TENANT, &NewLead::new("lead-foreign", "Sam", "Other", "+15550199"), fx.now())
        .unwrap();

    for (lead, agent) in [
        ("lead-missing", "agent-1"),
        ("lead-1", "agent-missing"),
        ("lead-1", "agent-retired"),
        ("lead-1", "agent-foreign"),
        ("lead-foreign", "agent-1"),
    ] {
        let err = fx
            .manager
            .create_assignment(&mut fx.store, &admin(), lead, agent, None)
            .unwrap_err();
        assert!(
            matches!(err, EngineError::NotFound { .. }),
            "{lead} -> {agent}: expected NotFound, got {err:?}"
        );
    }
    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-1").unwrap(), 0);
}

/// Expiry must lie in the future; ids must be present.
#[test]
fn malformed_requests_are_rejected_before_storage() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");

    let past = fx.now() - Duration::minutes(1);
    let err = fx
        .manager
        .create_assignment(&mut fx.store, &admin(), "lead-1", "agent-1", Some(past))
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "expires_at", .. }));

    let err = fx
        .manager
        .create_assignment(&mut fx.store, &admin(), " ", "agent-1", None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "lead_id", .. }));

    let custom = fx.now() + Duration::hours(2);
    let a = fx
        .manager
        .create_assignment(&mut fx.store, &admin(), "lead-1", "agent-1", Some(custom))
        .unwrap();
    assert_eq!(a.expires_at, custom);
}

/// Held leads in a multi-lead request are reported; the rest are assigned.
#[test]
fn multi_lead_assignment_is_partial_success() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.agent("agent-2");
    for id in ["lead-1", "lead-2", "lead-3"] {
        fx.lead(id);
    }
    fx.assign("lead-2", "agent-2");

    let ids: Vec<String> = ["lead-1", "lead-2", "lead-3", "lead-1"].iter().map(|s| s.to_string()).collect();
    let batch = fx
        .manager
        .assign_leads(&mut fx.store, &manager(), &ids, "agent-1", None)
        .unwrap();

    let assigned: Vec<&str> = batch.assignments.iter().map(|a| a.lead_id.as_str()).collect();
    assert_eq!(assigned, vec!["lead-1", "lead-3"]);
    assert_eq!(batch.conflicts.len(), 1);
    assert_eq!(batch.conflicts[0].lead_id, "lead-2");
    assert_eq!(batch.conflicts[0].held_by, "agent-2");
    assert_eq!(fx.load_of("agent-1"), 2);

    // Every lead already held: the whole request is a conflict.
    let err = fx
        .manager
        .assign_leads(&mut fx.store, &manager(), &ids, "agent-1", None)
        .unwrap_err();
    match err {
        EngineError::Conflict { conflicts } => assert_eq!(conflicts.len(), 3),
        other => panic!("expected Conflict, got {other:?}"),
    }
}

/// A missing lead fails the whole request and creates nothing.
#[test]
fn multi_lead_assignment_with_unknown_lead_creates_nothing() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");

    let ids = vec!["lead-1".to_string(), "lead-ghost".to_string()];
    let err = fx
        .manager
        .assign_leads(&mut fx.store, &admin(), &ids, "agent-1", None)
        .unwrap_err();
    match err {
        EngineError::NotFound { entity, id } => {
            assert_eq!(entity, "lead");
            assert_eq!(id, "lead-ghost");
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-1").unwrap(), 0);
    assert_eq!(fx.load_of("agent-1"), 0);
}

/// pending -> in_progress -> completed; completed is final.
#[test]
fn legal_transitions_move_load_and_illegal_ones_fail() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");
    let a = fx.assign("lead-1", "agent-1");
    let me = agent_actor("agent-1");

    let started = fx
        .manager
        .update_status(&mut fx.store, &me, &a.assignment_id, AssignmentStatus::InProgress)
        .unwrap();
    assert_eq!(started.status, AssignmentStatus::InProgress);
    assert_eq!(fx.load_of("agent-1"), 1);

    let err = fx
        .manager
        .update_status(&mut fx.store, &me, &a.assignment_id, AssignmentStatus::Pending)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { from: AssignmentStatus::InProgress, to: AssignmentStatus::Pending }
    ));

    fx.manager
        .update_status(&mut fx.store, &me, &a.assignment_id, AssignmentStatus::Completed)
        .unwrap();
    assert_eq!(fx.load_of("agent-1"), 0);

    let err = fx
        .manager
        .update_status(&mut fx.store, &me, &a.assignment_id, AssignmentStatus::Cancelled)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: AssignmentStatus::Completed, .. }));

    // Callers may never expire an assignment directly.
    fx.lead("lead-2");
    let b = fx.assign("lead-2", "agent-1");
    let err = fx
        .manager
        .update_status(&mut fx.store, &admin(), &b.assignment_id, AssignmentStatus::Expired)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let events = fx.store.event_count(TENANT, "assignment_transitioned").unwrap();
    assert_eq!(events, 2);
}

/// Cancelling frees the lead for a new claim and the agent's load slot.
#[test]
fn cancelled_assignment_releases_the_lead() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.agent("agent-2");
    fx.lead("lead-1");
    let a = fx.assign("lead-1", "agent-1");

    fx.manager
        .update_status(&mut fx.store, &manager(), &a.assignment_id, AssignmentStatus::Cancelled)
        .unwrap();
    assert_eq!(fx.load_of("agent-1"), 0);

    let b = fx.assign("lead-1", "agent-2");
    assert_eq!(b.status, AssignmentStatus::Pending);
    assert_eq!(fx.store.assignments_for_lead(TENANT, "lead-1").unwrap().len(), 2);
}

/// Agents work their own assignments only; uploaders assign but never work.
#[test]
fn role_rules_are_enforced() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.agent("agent-2");
    fx.lead("lead-1");
    fx.lead("lead-2");
    let a = fx.assign("lead-1", "agent-1");

    let err = fx
        .manager
        .update_status(&mut fx.store, &agent_actor("agent-2"), &a.assignment_id, AssignmentStatus::InProgress)
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let err = fx
        .manager
        .create_assignment(&mut fx.store, &agent_actor("agent-1"), "lead-2", "agent-1", None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let uploader = Actor::new("uploader", TENANT, Role::DataUploader);
    fx.manager
        .create_assignment(&mut fx.store, &uploader, "lead-2", "agent-2", None)
        .unwrap();
    let err = fx
        .manager
        .update_status(&mut fx.store, &uploader, &a.assignment_id, AssignmentStatus::Cancelled)
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    // An assignment in another tenant simply does not exist for this caller.
    let outsider = Actor::new("mgr-x", OTHER_TENANT, Role::Manager);
    let err = fx
        .manager
        .update_status(&mut fx.store, &outsider, &a.assignment_id, AssignmentStatus::Cancelled)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "assignment", .. }));
}

/// Each outcome closes the assignment and sets the matching lead status.
#[test]
fn recording_an_outcome_completes_and_updates_the_lead() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    let cases = [
        ("lead-int", CallOutcome::Interested, LeadStatus::Interested),
        ("lead-cb", CallOutcome::Callback, LeadStatus::Contacted),
        ("lead-na", CallOutcome::NoAnswer, LeadStatus::RetryPending),
        ("lead-wn", CallOutcome::WrongNumber, LeadStatus::NotInterested),
    ];
    for (lead_id, outcome, expected) in cases {
        fx.lead(lead_id);
        let a = fx.assign(lead_id, "agent-1");
        let done = fx
            .manager
            .record_outcome(&mut fx.store, &agent_actor("agent-1"), &a.assignment_id, outcome)
            .unwrap();
        assert_eq!(done.status, AssignmentStatus::Completed);

        let lead = fx.store.get_lead(TENANT, lead_id).unwrap().unwrap();
        assert_eq!(lead.status, expected, "{lead_id}");
        let last = fx.store.last_call_for_lead(TENANT, lead_id).unwrap().unwrap();
        assert_eq!(last.outcome, outcome);
        assert_eq!(last.assignment_id.as_deref(), Some(a.assignment_id.as_str()));
    }
    assert_eq!(fx.load_of("agent-1"), 0);

    // A second outcome on a closed assignment is an illegal transition.
    let closed = fx.store.assignments_for_lead(TENANT, "lead-int").unwrap().remove(0);
    let err = fx
        .manager
        .record_outcome(&mut fx.store, &admin(), &closed.assignment_id, CallOutcome::Answered)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: AssignmentStatus::Completed, .. }));
}

/// A do-not-call request switches reuse off for the lead for good.
#[test]
fn dnc_outcome_disables_reuse() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-dnc");
    let a = fx.assign("lead-dnc", "agent-1");
    fx.manager
        .record_outcome(&mut fx.store, &admin(), &a.assignment_id, CallOutcome::DncRequest)
        .unwrap();

    let lead = fx.store.get_lead(TENANT, "lead-dnc").unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::NotInterested);
    assert!(!lead.reuse_enabled);
}

struct Blocked(&'static str);

impl CreditGate for Blocked {
    fn may_assign(&self, _tenant_id: &str, agent_id: &str) -> EngineResult<bool> {
        Ok(agent_id != self.0)
    }
}

/// Direct assignment to an agent the billing ledger refuses is NoCapacity.
#[test]
fn credit_gate_blocks_direct_assignment() {
    let mut fx = Fixture::new();
    fx.agent("agent-broke");
    fx.agent("agent-ok");
    fx.lead("lead-1");
    let gated = fx.manager.clone().with_credit_gate(Arc::new(Blocked("agent-broke")));

    let err = gated
        .create_assignment(&mut fx.store, &admin(), "lead-1", "agent-broke", None)
        .unwrap_err();
    assert!(matches!(err, EngineError::NoCapacity { .. }));
    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-1").unwrap(), 0);

    gated
        .create_assignment(&mut fx.store, &admin(), "lead-1", "agent-ok", None)
        .unwrap();
}

/// Every ledger change leaves an audit record in the same transaction.
#[test]
fn ledger_changes_are_audited() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");
    let a = fx.assign("lead-1", "agent-1");
    fx.manager
        .record_outcome(&mut fx.store, &admin(), &a.assignment_id, CallOutcome::Busy)
        .unwrap();

    let events = fx.store.events_for_tenant(TENANT, 100).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["assignment_created", "assignment_transitioned", "call_outcome_recorded"]
    );
    assert_eq!(events[0].actor, "admin-1");
    assert_eq!(events[0].entity_id, a.assignment_id);
    assert!(events.iter().all(|e| e.decode().is_ok()));
}
