//! Lifecycle Tests
//!
//! Construction checks, restart over an existing store, stale lock
//! recovery, futures and counters.

use crate::common::*;
use converge::{MetaModel, MetaModelSpec, PhaseSpec, TypeRegistry};
use std::sync::Arc;

#[test]
fn zero_workers_fail_fast() {
    let result = testing::engine(EngineConfig {
        workers: 0,
        ..EngineConfig::default()
    });
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn registry_must_cover_the_model() {
    let model = MetaModel::new(
        "partial",
        MetaModelSpec::new("Namespace")
            .external_type("Value", "ValueState", "calc")
            .internal_type("ValueState", vec![PhaseSpec::new("calc")])
            .internal_type("Unimplemented", vec![PhaseSpec::new("calc")]),
    )
    .unwrap();
    let registry = TypeRegistry::new()
        .with("ValueState", Arc::new(testing::ValueState))
        .unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let err = converge::Engine::new(EngineConfig::default(), store, model, registry)
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnknownType(_)));
    assert!(err.is_fatal());
}

#[test]
fn restart_resyncs_existing_objects() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    {
        let t = TestEngine::on_store(fast_config(), Arc::clone(&store));
        t.value("A", 5);
        t.value("B", 6);
        t.wait_result(&TestEngine::value_id("A"), json!(5));
        t.engine.shutdown();
    }

    // Written while no engine was running.
    let x = TestEngine::operator_id("X");
    store
        .create_object(StoredObject::new(
            x.clone(),
            ObjectData::External(converge::ExternalState::new(json!({
                "operator": "ADD",
                "operands": ["A", "B"]
            }))),
        ))
        .unwrap();

    let t = TestEngine::on_store(fast_config(), store);
    t.wait_result(&x, json!(11));
}

#[test]
fn stale_namespace_lock_is_cleared_on_start() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let ns = ObjectId::new(testing::NAMESPACE, "", NS);
    store
        .create_object(StoredObject::new(
            ns,
            ObjectData::Namespace(converge::NamespaceState {
                run_lock: Some(RunId::new()),
            }),
        ))
        .unwrap();

    let t = TestEngine::on_store(fast_config(), store);
    let a = t.value("A", 5);
    t.wait_result(&a, json!(5));
    t.settle();
    assert_eq!(t.namespace_lock(), None);
}

#[test]
fn future_fires_on_status() {
    let t = TestEngine::new();
    let a = TestEngine::value_id("A");
    let completed = t.engine.future(Status::Completed, &a);
    t.value("A", 5);
    assert!(completed.wait(&ctx()));
}

#[test]
fn wait_for_honors_context() {
    let t = TestEngine::new();
    let never = TestEngine::value_id("never");
    let short = Context::background().with_timeout(std::time::Duration::from_millis(50));
    assert!(!t.engine.wait_status(&short, &never, Status::Completed));
}

#[test]
fn stats_count_runs_and_commits() {
    let t = TestEngine::new();
    t.value("A", 5);
    t.value("B", 6);
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(11));
    t.settle();

    let stats = t.engine.stats();
    assert!(stats.runs_granted >= 3);
    assert!(stats.elements_committed >= 3);
    assert_eq!(stats.pool.active, 0);
    assert_eq!(stats.pool.queue_depth, 0);
    assert_eq!(stats.pool.worker_count, 4);
}

#[test]
fn shutdown_is_idempotent() {
    let t = TestEngine::new();
    t.engine.shutdown();
    t.engine.shutdown();
    assert_eq!(t.engine.stats().pool.worker_count, 0);
}

#[test]
fn config_file_drives_engine() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join(converge::CONFIG_FILE_NAME);
    std::fs::write(&path, "workers = 2\nretry_delay_ms = 1\n").unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    let t = TestEngine::with_config(config);
    assert_eq!(t.engine.config().workers, 2);
    let a = t.value("A", 3);
    t.wait_result(&a, json!(3));
}
