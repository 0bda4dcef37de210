//! File-backed store tests
//!
//! Several store handles (standing in for several processes) on one
//! directory must see each other's writes and never double-claim.

use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use strand_engine::idempotency::stable_tags;
use strand_engine::progs::builtin_registry;
use strand_engine::progs::nic::CREATED;
use strand_engine::{
    Directive, Engine, EngineConfig, FileStrandStore, Handler, ManualClock, Prog, ProgRegistry,
    RunOutcome, Runtime, StepContext, StepResult, StrandState, StrandStore, SystemClock,
};
use strand_provider::{MemoryProvider, ResourceKind, ResourceSpec};
use tempfile::TempDir;

fn create_once(ctx: &mut StepContext<'_>) -> StepResult {
    let tags = stable_tags(ctx.subject_id(), "counter");
    ctx.client()
        .create(&ResourceSpec::new(ResourceKind::ElasticAddress), &tags)?;
    Ok(Directive::pop("done"))
}

fn once_registry() -> Arc<ProgRegistry> {
    let mut registry = ProgRegistry::new();
    registry.register(Prog::new("Once", "run", vec![("run", create_once as Handler)]));
    Arc::new(registry)
}

// =============================================================================
// Persistence across handles
// =============================================================================

#[test]
fn test_strand_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());

    let id = {
        let engine = Engine::new(
            Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
            Arc::new(builtin_registry()),
            clock.clone(),
        );
        engine
            .start("Nic", "nic-1", json!({"cidr": "10.0.0.0/24"}))
            .unwrap()
    };

    let reopened = Engine::new(
        Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
        Arc::new(builtin_registry()),
        clock,
    );
    let strand = reopened.get(&id).unwrap();
    assert_eq!(strand.label, "create_primary_network_endpoint");
    assert_eq!(strand.root_frame().unwrap().local("cidr"), Some(&json!("10.0.0.0/24")));
    assert_eq!(reopened.list().unwrap().len(), 1);
}

#[test]
fn test_nic_create_resumes_in_new_process() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let provider = MemoryProvider::new();

    let runtime_for = |store: FileStrandStore| Runtime {
        store: Arc::new(store),
        registry: Arc::new(builtin_registry()),
        client: Arc::new(provider.clone()),
        clock: clock.clone(),
        config: EngineConfig::default(),
    };

    let engine = Engine::new(
        Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
        Arc::new(builtin_registry()),
        clock.clone(),
    );
    let id = engine
        .start("Nic", "nic-1", json!({"cidr": "10.0.0.0/24"}))
        .unwrap();

    // Each dispatch uses a fresh handle, as separate `strand work --once`
    // invocations would.
    for expected in [RunOutcome::Napped, RunOutcome::Napped, RunOutcome::Finished] {
        let runtime = runtime_for(FileStrandStore::open(temp_dir.path()).unwrap());
        let reports = runtime.dispatcher("w1").poll_once().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, expected);
        provider.settle_all();
        clock.advance_secs(1);
    }

    let status = engine.status(&id).unwrap();
    assert_eq!(status.state, StrandState::Finished);
    assert_eq!(status.exitval, Some(json!(CREATED)));

    let store = FileStrandStore::open(temp_dir.path()).unwrap();
    assert!(store.subject("nic-1").unwrap().is_some());
    assert!(temp_dir.path().join("subjects").join("nic-1.json").exists());
}

#[test]
fn test_cancel_from_other_handle_is_seen() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let provider = MemoryProvider::new();
    let runtime = Runtime {
        store: Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
        registry: Arc::new(builtin_registry()),
        client: Arc::new(provider.clone()),
        clock: clock.clone(),
        config: EngineConfig::default(),
    };
    let engine = Engine::new(
        Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
        Arc::new(builtin_registry()),
        clock.clone(),
    );

    let id = engine
        .start("Nic", "nic-1", json!({"cidr": "10.0.0.0/24"}))
        .unwrap();
    runtime.dispatcher("w1").poll_once().unwrap();
    assert_eq!(provider.count(ResourceKind::Subnet), 1);

    engine.cancel(&id).unwrap();
    let reports = runtime.dispatcher("w1").poll_once().unwrap();
    assert_eq!(reports[0].outcome, RunOutcome::Finished);
    assert_eq!(provider.count(ResourceKind::Subnet), 0);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_workers_on_separate_handles_never_double_run() {
    let temp_dir = TempDir::new().unwrap();
    let provider = MemoryProvider::new();
    let registry = once_registry();

    let engine = Engine::new(
        Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
        Arc::clone(&registry),
        Arc::new(SystemClock),
    );
    let ids: Vec<String> = (0..12)
        .map(|i| engine.start("Once", &format!("subject-{}", i), Value::Null).unwrap())
        .collect();

    let handles: Vec<_> = (0..3)
        .map(|w| {
            let mut config = EngineConfig::default();
            config.batch_size = 2;
            let runtime = Runtime {
                store: Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
                registry: Arc::clone(&registry),
                client: Arc::new(provider.clone()),
                clock: Arc::new(SystemClock),
                config,
            };
            let dispatcher = runtime.dispatcher(format!("w{}", w));
            thread::spawn(move || dispatcher.run_until_idle(100).unwrap())
        })
        .collect();

    let reports: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(reports.len(), ids.len());
    assert!(reports.iter().all(|r| r.outcome == RunOutcome::Finished));
    assert_eq!(provider.count(ResourceKind::ElasticAddress), ids.len());

    for status in engine.list().unwrap() {
        assert!(status.terminal);
        assert_eq!(status.leased_by, None);
    }
}

#[test]
fn test_concurrent_signals_are_counted() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::new(
        Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
        once_registry(),
        Arc::new(SystemClock),
    );
    let id = engine.start("Once", "subject-1", Value::Null).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Engine::new(
                Arc::new(FileStrandStore::open(temp_dir.path()).unwrap()),
                once_registry(),
                Arc::new(SystemClock),
            );
            let id = id.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    engine.signal(&id).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.get(&id).unwrap().semaphore_count, 20);
}
