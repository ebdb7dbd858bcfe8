//! Bulk assignment tests — filtered, oldest-first, never over a held lead.

mod common;

use common::{admin, manager, t0, Fixture, TENANT};
use dialer_core::{
    assignment::AssignmentStatus,
    error::EngineError,
    lead::{LeadFilters, LeadStatus, NewLead},
};

fn imported(fx: &Fixture, lead_id: &str, age_days: i64, edit: impl FnOnce(&mut NewLead)) {
    let mut lead = NewLead::new(lead_id, "Pat", lead_id, "+15550100");
    edit(&mut lead);
    fx.store
        .insert_lead(TENANT, &lead, t0() - chrono::Duration::days(age_days))
        .unwrap();
}

/// Asking for five when three qualify hands over the three.
#[test]
fn bulk_assign_returns_what_is_available() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.agent("agent-2");
    for (i, id) in ["lead-1", "lead-2", "lead-3", "lead-4"].iter().enumerate() {
        fx.lead_aged(id, 10 - i as i64);
    }
    fx.assign("lead-2", "agent-2");

    let filters = LeadFilters { status: Some(LeadStatus::New), ..Default::default() };
    let result = fx
        .manager
        .bulk_assign(&mut fx.store, &manager(), "agent-1", 5, &filters)
        .unwrap();
    assert_eq!(result.requested_count, 5);
    assert_eq!(result.assigned_lead_ids, vec!["lead-1", "lead-3", "lead-4"]);
    assert!(result.assignments.iter().all(|a| a.status == AssignmentStatus::Pending));
    assert_eq!(fx.load_of("agent-1"), 3);
    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-2").unwrap(), 1);
}

/// Oldest leads go first; the count caps the claim.
#[test]
fn bulk_assign_takes_oldest_leads_first() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead_aged("lead-young", 1);
    fx.lead_aged("lead-old", 30);
    fx.lead_aged("lead-mid", 7);

    let result = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 2, &LeadFilters::default())
        .unwrap();
    assert_eq!(result.assigned_lead_ids, vec!["lead-old", "lead-mid"]);
}

/// Only new and retry-pending leads are drawn by default.
#[test]
fn bulk_assign_skips_worked_leads() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    imported(&fx, "lead-new", 5, |_| {});
    imported(&fx, "lead-retry", 4, |l| l.status = LeadStatus::RetryPending);
    imported(&fx, "lead-contacted", 3, |l| l.status = LeadStatus::Contacted);
    imported(&fx, "lead-won", 2, |l| l.status = LeadStatus::Interested);

    let result = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 10, &LeadFilters::default())
        .unwrap();
    assert_eq!(result.assigned_lead_ids, vec!["lead-new", "lead-retry"]);

    imported(&fx, "lead-retry-2", 1, |l| l.status = LeadStatus::RetryPending);
    imported(&fx, "lead-new-2", 1, |_| {});
    let filters = LeadFilters { status: Some(LeadStatus::RetryPending), ..Default::default() };
    let result = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 10, &filters)
        .unwrap();
    assert_eq!(result.assigned_lead_ids, vec!["lead-retry-2"]);
}

/// Campaign, industry and location narrow the pool.
#[test]
fn bulk_assign_applies_filters() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    imported(&fx, "lead-a", 5, |l| {
        l.campaign_id = Some("spring".into());
        l.industry = Some("retail".into());
        l.location = Some("Austin, TX".into());
    });
    imported(&fx, "lead-b", 4, |l| {
        l.campaign_id = Some("spring".into());
        l.industry = Some("retail".into());
        l.location = Some("Denver, CO".into());
    });
    imported(&fx, "lead-c", 3, |l| {
        l.campaign_id = Some("spring".into());
        l.industry = Some("finance".into());
        l.location = Some("austin, tx".into());
    });
    imported(&fx, "lead-d", 2, |l| {
        l.campaign_id = Some("fall".into());
        l.industry = Some("retail".into());
        l.location = Some("AUSTIN".into());
    });

    let filters = LeadFilters {
        campaign_id: Some("spring".into()),
        industry: Some("retail".into()),
        location: Some("austin".into()),
        ..Default::default()
    };
    let result = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 10, &filters)
        .unwrap();
    assert_eq!(result.assigned_lead_ids, vec!["lead-a"]);

    let by_location = LeadFilters { location: Some("AuStIn".into()), ..Default::default() };
    let result = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 10, &by_location)
        .unwrap();
    assert_eq!(result.assigned_lead_ids, vec!["lead-c", "lead-d"]);
}

/// Nothing eligible is a NotFound that echoes the filters.
#[test]
fn bulk_assign_with_nothing_eligible_is_not_found() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");
    fx.assign("lead-1", "agent-1");

    let err = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 3, &LeadFilters::default())
        .unwrap_err();
    match err {
        EngineError::NotFound { entity, id } => {
            assert_eq!(entity, "eligible leads");
            assert_eq!(id, "no filters");
        }
        other => panic!("expected NotFound, got {other:?}"),
    }

    let filters = LeadFilters { campaign_id: Some("winter".into()), ..Default::default() };
    let err = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 3, &filters)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { id, .. } if id == "campaign=winter"));
}

/// Count bounds and status filters are checked up front.
#[test]
fn bulk_assign_rejects_bad_requests() {
    let mut fx = Fixture::new();
    fx.agent("agent-1");
    fx.lead("lead-1");

    for count in [0, fx.config.max_bulk_count + 1] {
        let err = fx
            .manager
            .bulk_assign(&mut fx.store, &admin(), "agent-1", count, &LeadFilters::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "count", .. }), "count {count}");
    }

    let filters = LeadFilters { status: Some(LeadStatus::Interested), ..Default::default() };
    let err = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-1", 1, &filters)
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "filters.status", .. }));

    let err = fx
        .manager
        .bulk_assign(&mut fx.store, &admin(), "agent-ghost", 1, &LeadFilters::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "agent", .. }));
    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-1").unwrap(), 0);
}
