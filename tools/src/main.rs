//! lead-runner: headless runner for the lead assignment and reuse engine.
//!
//! Usage:
//!   lead-runner --db leads.db --data-dir ./data            (sweep until stdin closes)
//!   lead-runner --db leads.db --once                       (one tick, print report)
//!   lead-runner --db leads.db --seed-demo 42 --once
//!   lead-runner --db leads.db --ipc-mode                   (JSON commands on stdin)

use anyhow::Result;
use dialer_core::{
    agent::{Agent, Unmetered},
    assignment::{AssignmentQuery, AssignmentStatus, StatsPeriod},
    assignment_manager::AssignmentManager,
    auth::Actor,
    clock::{Clock, SystemClock},
    config::EngineConfig,
    engine::SweepEngine,
    lead::{CallOutcome, CallRecord, LeadFilters, NewLead},
    reuse_policy::ReusePolicy,
    reuse_scheduler::ReuseScheduler,
    store::EngineStore,
    types::Timestamp,
};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const DEMO_TENANT: &str = "demo";

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Tick,
    Assign {
        actor:    Actor,
        lead_ids: Vec<String>,
        agent_id: String,
        #[serde(default)]
        expires_at: Option<Timestamp>,
    },
    BulkAssign {
        actor:    Actor,
        agent_id: String,
        count:    u32,
        #[serde(default)]
        filters:  LeadFilters,
    },
    UpdateStatus {
        actor:         Actor,
        assignment_id: String,
        status:        AssignmentStatus,
    },
    RecordOutcome {
        actor:         Actor,
        assignment_id: String,
        outcome:       CallOutcome,
    },
    ListAssignments {
        actor:  Actor,
        #[serde(default)]
        status: Option<AssignmentStatus>,
        #[serde(default = "default_limit")]
        limit:  u32,
        #[serde(default)]
        offset: u32,
    },
    MyLeads {
        actor:  Actor,
        #[serde(default)]
        status: Option<AssignmentStatus>,
        #[serde(default = "default_limit")]
        limit:  u32,
        #[serde(default)]
        offset: u32,
    },
    Stats {
        actor:  Actor,
        period: String,
    },
    GetReuseSettings {
        actor: Actor,
    },
    UpdateReuseSettings {
        actor:  Actor,
        policy: ReusePolicy,
    },
    UnpickedLeads {
        actor:  Actor,
        #[serde(default = "default_limit")]
        limit:  u32,
        #[serde(default)]
        offset: u32,
    },
    ProcessNow {
        actor: Actor,
    },
    ManualReuse {
        actor:    Actor,
        lead_ids: Vec<String>,
    },
    ReuseMetrics {
        actor: Actor,
    },
    RebuildLoadIndex {
        actor: Actor,
    },
    Quit,
}

fn default_limit() -> u32 {
    50
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let once = args.iter().any(|a| a == "--once");
    let db = arg_value(&args, "--db").unwrap_or(":memory:");
    let data_dir = arg_value(&args, "--data-dir").unwrap_or("./data");
    let demo_seed: Option<u64> = arg_value(&args, "--seed-demo").and_then(|s| s.parse().ok());

    let config = match EngineConfig::load(data_dir) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("{e}; using built-in defaults");
            EngineConfig::default()
        }
    };
    let interval = Duration::from_secs(parse_arg(&args, "--interval-secs", config.sweep_interval_secs));

    if !ipc_mode {
        println!("lead-runner");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!("  interval:  {}s", interval.as_secs());
        println!();
    }

    // For :memory: use SQLite shared-memory URI so the sweep engine and the
    // command connection see the same in-memory database.
    let db_effective: String = if db == ":memory:" {
        format!("file:leadrun_{}?mode=memory&cache=shared", epoch_secs())
    } else {
        db.to_string()
    };
    let store = EngineStore::open_with_timeout(&db_effective, config.busy_timeout())?;
    store.migrate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    if let Some(seed) = demo_seed {
        seed_demo(&mut store.reopen()?, seed, clock.now())?;
    }

    let mut engine = SweepEngine::build(store.reopen()?, &config, clock.clone(), Arc::new(Unmetered));

    if ipc_mode {
        let mut commands = store;
        run_ipc_loop(&mut engine, &mut commands, &config, clock)?;
    } else if once {
        let report = engine.tick()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            // Any input line, or EOF, stops the loop.
            let mut line = String::new();
            let _ = io::stdin().lock().read_line(&mut line);
            let _ = tx.send(());
        });
        let ticks = engine.run(interval, &rx);
        println!("=== RUN SUMMARY ===");
        println!("  ticks run:  {ticks}");
        println!("  tenants:    {}", engine.store().tenants()?.len());
    }

    Ok(())
}

fn run_ipc_loop(
    engine: &mut SweepEngine,
    store: &mut EngineStore,
    config: &EngineConfig,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    let manager = AssignmentManager::new(config.clone(), clock.clone());
    let scheduler = ReuseScheduler::new(config.clone(), clock);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };
        if let IpcCommand::Quit = cmd {
            break;
        }

        let reply = match handle_command(engine, store, &manager, &scheduler, cmd) {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(
    engine: &mut SweepEngine,
    store: &mut EngineStore,
    manager: &AssignmentManager,
    scheduler: &ReuseScheduler,
    cmd: IpcCommand,
) -> Result<serde_json::Value> {
    let value = match cmd {
        IpcCommand::Tick => serde_json::to_value(engine.tick()?)?,
        IpcCommand::Assign { actor, lead_ids, agent_id, expires_at } => {
            serde_json::to_value(manager.assign_leads(store, &actor, &lead_ids, &agent_id, expires_at)?)?
        }
        IpcCommand::BulkAssign { actor, agent_id, count, filters } => {
            serde_json::to_value(manager.bulk_assign(store, &actor, &agent_id, count, &filters)?)?
        }
        IpcCommand::UpdateStatus { actor, assignment_id, status } => {
            serde_json::to_value(manager.update_status(store, &actor, &assignment_id, status)?)?
        }
        IpcCommand::RecordOutcome { actor, assignment_id, outcome } => {
            serde_json::to_value(manager.record_outcome(store, &actor, &assignment_id, outcome)?)?
        }
        IpcCommand::ListAssignments { actor, status, limit, offset } => {
            let query = AssignmentQuery { status, campaign_id: None, limit, offset };
            serde_json::to_value(manager.list_assignments(store, &actor, &query)?)?
        }
        IpcCommand::MyLeads { actor, status, limit, offset } => {
            serde_json::to_value(manager.my_leads(store, &actor, status, limit, offset)?)?
        }
        IpcCommand::Stats { actor, period } => {
            let period = StatsPeriod::parse(&period)
                .ok_or_else(|| anyhow::anyhow!("unknown period '{period}' (1d, 7d, 30d, all)"))?;
            serde_json::to_value(manager.assignment_stats(store, &actor, period)?)?
        }
        IpcCommand::GetReuseSettings { actor } => {
            serde_json::to_value(scheduler.get_reuse_settings(store, &actor)?)?
        }
        IpcCommand::UpdateReuseSettings { actor, policy } => {
            serde_json::to_value(scheduler.update_reuse_settings(store, &actor, &policy)?)?
        }
        IpcCommand::UnpickedLeads { actor, limit, offset } => {
            serde_json::to_value(scheduler.list_unpicked_leads(store, &actor, limit, offset)?)?
        }
        IpcCommand::ProcessNow { actor } => serde_json::to_value(scheduler.process_now(store, &actor)?)?,
        IpcCommand::ManualReuse { actor, lead_ids } => {
            serde_json::to_value(scheduler.trigger_manual_reuse(store, &actor, &lead_ids)?)?
        }
        IpcCommand::ReuseMetrics { actor } => {
            serde_json::to_value(scheduler.reuse_metrics(store, &actor, None)?)?
        }
        IpcCommand::RebuildLoadIndex { actor } => {
            serde_json::to_value(manager.rebuild_load_index(store, &actor)?)?
        }
        IpcCommand::Quit => serde_json::Value::Null,
    };
    Ok(value)
}

/// Populate a reproducible demo tenant: agents, leads and a backlog of
/// call outcomes spread over the last four days.
fn seed_demo(store: &mut EngineStore, seed: u64, now: Timestamp) -> Result<()> {
    const FIRST: [&str; 8] = ["Ada", "Grace", "Alan", "Edsger", "Barbara", "Ken", "Frances", "Dennis"];
    const LAST: [&str; 8] = ["Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Thompson", "Allen", "Ritchie"];
    const INDUSTRIES: [&str; 3] = ["insurance", "solar", "telecom"];
    const CITIES: [&str; 4] = ["Austin, TX", "Denver, CO", "Tampa, FL", "Boise, ID"];
    const OUTCOMES: [CallOutcome; 6] = [
        CallOutcome::NoAnswer,
        CallOutcome::NoAnswer,
        CallOutcome::Busy,
        CallOutcome::Missed,
        CallOutcome::Voicemail,
        CallOutcome::NotInterested,
    ];

    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    for i in 1..=4 {
        store.upsert_agent(&Agent::new(format!("agent-{i}"), DEMO_TENANT, &format!("Agent {i}")))?;
    }

    let lead_count = rng.gen_range(30..=60);
    for i in 0..lead_count {
        let first = FIRST.choose(&mut rng).copied().unwrap_or("Pat");
        let last = LAST.choose(&mut rng).copied().unwrap_or("Doe");
        let mut lead = NewLead::new(format!("lead-{i:04}"), first, last, &format!("+1555{:07}", rng.gen_range(0..10_000_000)))
            .in_campaign(if rng.gen_bool(0.5) { "spring" } else { "summer" });
        lead.industry = INDUSTRIES.choose(&mut rng).map(|s| s.to_string());
        lead.location = CITIES.choose(&mut rng).map(|s| s.to_string());
        let created_at = now - chrono::Duration::days(rng.gen_range(5..30));
        store.insert_lead(DEMO_TENANT, &lead, created_at)?;

        // Two in three leads have already been dialed once.
        if rng.gen_range(0..3) > 0 {
            let outcome = *OUTCOMES.choose(&mut rng).unwrap_or(&CallOutcome::NoAnswer);
            store.record_call_outcome(
                DEMO_TENANT,
                &CallRecord {
                    call_id:       format!("demo-call-{i:04}"),
                    lead_id:       lead.lead_id.clone(),
                    agent_id:      None,
                    assignment_id: None,
                    outcome,
                    occurred_at:   now - chrono::Duration::hours(rng.gen_range(1..96)),
                },
            )?;
        }
    }

    log::info!("seeded demo tenant '{DEMO_TENANT}' with {lead_count} leads (seed {seed})");
    Ok(())
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
