//! Concurrency tests — many connections, one database file.
//!
//! Every thread opens its own connection, as separate request handlers
//! and the sweep engine do in production.

mod common;

use chrono::Duration;
use common::{admin, cleanup, manager, t0, temp_db, Fixture, TENANT};
use dialer_core::{
    error::EngineError,
    lead::{CallOutcome, LeadFilters},
    store::EngineStore,
};
use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
};

const THREADS: usize = 8;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simultaneous claims on one lead: exactly one wins, the rest conflict.
#[test]
fn concurrent_claims_on_one_lead_have_one_winner() {
    init_logging();
    let path = temp_db();
    let fx = Fixture::with_store(EngineStore::open(&path).unwrap());
    for i in 0..THREADS {
        fx.agent(&format!("agent-{i}"));
    }
    fx.lead("lead-hot");

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let path = path.clone();
            let barrier = barrier.clone();
            let assigner = fx.manager.clone();
            thread::spawn(move || {
                let mut store = EngineStore::open(&path).unwrap();
                barrier.wait();
                assigner.create_assignment(&mut store, &admin(), "lead-hot", &format!("agent-{i}"), None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let winner = &winners[0].agent_id;
    for r in &results {
        if let Err(e) = r {
            match e {
                EngineError::Conflict { conflicts } => assert_eq!(&conflicts[0].held_by, winner),
                other => panic!("expected Conflict, got {other:?}"),
            }
        }
    }

    assert_eq!(fx.store.open_assignment_count(TENANT, "lead-hot").unwrap(), 1);
    let loads: u32 = fx.store.agent_load_index(TENANT).unwrap().iter().map(|a| a.open_assignments).sum();
    assert_eq!(loads, 1);

    drop(fx);
    cleanup(&path);
}

/// Parallel bulk requests split the pool; no lead is handed out twice.
#[test]
fn concurrent_bulk_assigns_take_disjoint_leads() {
    init_logging();
    let path = temp_db();
    let fx = Fixture::with_store(EngineStore::open(&path).unwrap());
    let workers = 4;
    for i in 0..workers {
        fx.agent(&format!("agent-{i}"));
    }
    for i in 0..20 {
        fx.lead_aged(&format!("lead-{i:02}"), 30 - i);
    }

    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let path = path.clone();
            let barrier = barrier.clone();
            let assigner = fx.manager.clone();
            thread::spawn(move || {
                let mut store = EngineStore::open(&path).unwrap();
                barrier.wait();
                assigner.bulk_assign(&mut store, &manager(), &format!("agent-{i}"), 8, &LeadFilters::default())
            })
        })
        .collect();

    let mut handed_out = Vec::new();
    for h in handles {
        match h.join().unwrap() {
            Ok(result) => handed_out.extend(result.assigned_lead_ids),
            Err(EngineError::NotFound { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    let distinct: HashSet<&String> = handed_out.iter().collect();
    assert_eq!(handed_out.len(), 20);
    assert_eq!(distinct.len(), 20);

    for i in 0..20 {
        assert_eq!(fx.store.open_assignment_count(TENANT, &format!("lead-{i:02}")).unwrap(), 1);
    }
    let drift = fx.store.reopen().unwrap().rebuild_load_index(TENANT, "test", fx.now()).unwrap();
    assert!(drift.is_empty(), "{drift:?}");

    drop(fx);
    cleanup(&path);
}

/// Overlapping reuse runs recycle each lead exactly once.
#[test]
fn concurrent_reuse_runs_recycle_each_lead_once() {
    init_logging();
    let path = temp_db();
    let mut fx = Fixture::with_store(EngineStore::open(&path).unwrap());
    fx.agent("agent-a");
    fx.agent("agent-b");
    let leads: Vec<String> = (0..10).map(|i| format!("lead-{i}")).collect();
    for (i, id) in leads.iter().enumerate() {
        fx.lead(id);
        fx.call(id, CallOutcome::NoAnswer, t0() - Duration::hours(30 + i as i64));
    }

    let runs = 4;
    let barrier = Arc::new(Barrier::new(runs));
    let handles: Vec<_> = (0..runs)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            let scheduler = fx.scheduler.clone();
            thread::spawn(move || {
                let mut store = EngineStore::open(&path).unwrap();
                barrier.wait();
                scheduler.process_now(&mut store, &admin()).unwrap()
            })
        })
        .collect();
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let recycled: u32 = reports.iter().map(|r| r.processed).sum();
    assert_eq!(recycled, 10);
    assert!(reports.iter().all(|r| r.failed == 0));

    for id in &leads {
        let lead = fx.store.get_lead(TENANT, id).unwrap().unwrap();
        assert_eq!(lead.reuse_count, 1, "{id}");
        assert_eq!(fx.store.open_assignment_count(TENANT, id).unwrap(), 1);
        assert_eq!(fx.store.reuse_log(TENANT, id).unwrap().len(), 1);
    }
    // Even split across the two agents.
    assert_eq!(fx.load_of("agent-a"), 5);
    assert_eq!(fx.load_of("agent-b"), 5);

    let drift = fx.manager.rebuild_load_index(&mut fx.store, &admin()).unwrap();
    assert!(drift.is_empty());

    drop(fx);
    cleanup(&path);
}
