//! Value Tests
//!
//! Single elements without dependencies.

use crate::common::*;

#[test]
fn value_completes_with_its_number() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    t.wait_result(&a, json!(5));

    let status = t.status(&a);
    assert!(status.observed_version.is_some());
    assert!(status.run_id.is_some());
    assert!(status
        .formal_version
        .as_deref()
        .unwrap()
        .starts_with(&format!("ValueState/{}/A/calc[", NS)));
}

#[test]
fn value_update_is_reconciled() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    t.wait_result(&a, json!(5));
    let first = t.status(&a).observed_version;

    t.value("A", 7);
    t.wait_result(&a, json!(7));
    assert_ne!(t.status(&a).observed_version, first);
}

#[test]
fn unchanged_spec_starts_no_run() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    t.wait_result(&a, json!(5));
    t.settle();
    let granted = t.engine.stats().runs_granted;

    t.value("A", 5);
    t.settle();
    assert_eq!(t.engine.stats().runs_granted, granted);
}

#[test]
fn invalid_spec_is_reported() {
    let t = TestEngine::new();
    let a = TestEngine::value_id("A");
    t.engine.apply(a.clone(), json!({ "value": "five" })).unwrap();
    t.wait_status(&a, Status::Invalid);
    assert!(t.status(&a).message.unwrap().contains("integer"));

    // A corrected spec recovers.
    t.value("A", 5);
    t.wait_result(&a, json!(5));
}

#[test]
fn hashed_formal_versions() {
    let t = TestEngine::with_config(EngineConfig {
        hashed_versions: true,
        ..fast_config()
    });
    let a = t.value("A", 1);
    t.wait_result(&a, json!(1));
    let fv = t.status(&a).formal_version.unwrap();
    assert_eq!(fv.len(), 64);
    assert!(fv.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn many_values_converge() {
    let t = TestEngine::new();
    let ids: Vec<ObjectId> = (0..50).map(|i| t.value(&format!("v{}", i), i)).collect();
    for (i, id) in ids.iter().enumerate() {
        t.wait_result(id, json!(i));
    }
    t.settle();
    assert_eq!(t.namespace_lock(), None);
}
