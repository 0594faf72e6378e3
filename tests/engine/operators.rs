//! Operator Tests
//!
//! Elements with dependencies: ordering, blocking, updates and chaining.

use crate::common::*;

#[test]
fn add_in_order() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    let b = t.value("B", 6);
    t.wait_result(&a, json!(5));
    t.wait_result(&b, json!(6));

    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(11));

    let fv = t.status(&x).formal_version.unwrap();
    assert!(fv.starts_with(&format!("OperatorState/{}/X/calc[", NS)));
    assert!(fv.contains(&format!("ValueState/{}/A/calc[", NS)));
    assert!(fv.contains(&format!("ValueState/{}/B/calc[", NS)));
}

#[test]
fn add_all_at_once() {
    let t = TestEngine::new();
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.value("A", 5);
    t.value("B", 6);
    t.wait_result(&x, json!(11));
}

#[test]
fn operator_before_values_is_blocked_then_completes() {
    let t = TestEngine::new();
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_status(&x, Status::Blocked);
    assert!(t.status(&x).message.unwrap().contains("does not exist"));

    t.value("A", 5);
    t.value("B", 6);
    t.wait_result(&x, json!(11));
}

#[test]
fn operand_update_propagates() {
    let t = TestEngine::new();
    t.value("A", 5);
    t.value("B", 6);
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(11));

    t.value("A", 6);
    t.wait_result(&x, json!(12));
}

#[test]
fn operator_spec_update() {
    let t = TestEngine::new();
    t.value("A", 3);
    t.value("B", 4);
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(7));

    t.operator("X", "MUL", &["A", "B"]);
    t.wait_result(&x, json!(12));
}

#[test]
fn published_result_feeds_next_operator() {
    let t = TestEngine::new();
    t.value("A", 5);
    t.value("B", 6);
    t.value("TWO", 2);
    let x = t.operator_spec(
        "X",
        json!({ "operator": "ADD", "operands": ["A", "B"], "publish": "C" }),
    );
    let y = t.operator("Y", "MUL", &["C", "TWO"]);

    t.wait_result(&x, json!(11));
    t.wait_result(&TestEngine::value_id("C"), json!(11));
    t.wait_result(&y, json!(22));

    t.value("B", 7);
    t.wait_result(&y, json!(24));
}

#[test]
fn failure_then_recovery() {
    let t = TestEngine::new();
    t.value("A", 1);
    t.value("Z", 0);
    let x = t.operator("X", "DIV", &["A", "Z"]);
    t.wait_status(&x, Status::Failed);
    assert!(t.status(&x).message.is_some());

    t.value("Z", 1);
    t.wait_result(&x, json!(1));
}

#[test]
fn invalid_operator_spec() {
    let t = TestEngine::new();
    let x = t.operator("X", "POW", &["A"]);
    t.wait_status(&x, Status::Invalid);
}

#[test]
fn diamond_of_operators() {
    let t = TestEngine::new();
    t.value("A", 2);
    let l = t.operator_spec(
        "L",
        json!({ "operator": "ADD", "operands": ["A"], "publish": "LV" }),
    );
    let r = t.operator_spec(
        "R",
        json!({ "operator": "MUL", "operands": ["A", "A"], "publish": "RV" }),
    );
    let top = t.operator("TOP", "SUB", &["RV", "LV"]);
    t.wait_result(&l, json!(2));
    t.wait_result(&r, json!(4));
    t.wait_result(&top, json!(2));

    t.value("A", 3);
    t.wait_result(&top, json!(6));
}

#[test]
fn concurrent_updates_settle_on_last_value() {
    let t = TestEngine::new();
    t.value("A", 0);
    t.value("B", 0);
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(0));

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=20 {
                t.value("A", i);
            }
        });
        s.spawn(|| {
            for i in 1..=20 {
                t.value("B", i * 10);
            }
        });
    });
    t.wait_result(&x, json!(220));
    t.settle();
    assert_eq!(t.namespace_lock(), None);
}
