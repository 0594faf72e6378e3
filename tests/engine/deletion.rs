//! Deletion Tests
//!
//! Removing external objects removes their internal objects and blocks
//! dependents.

use crate::common::*;

#[test]
fn deleting_a_value_removes_its_internal_object() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    t.wait_result(&a, json!(5));

    t.delete(&a);
    t.wait_gone(&ObjectId::new(testing::VALUE_STATE, NS, "A"));
    t.settle();
    assert!(t.internal_objects().is_empty());
    assert_eq!(t.namespace_lock(), None);
    assert!(t.engine.stats().elements_deleted >= 1);
}

#[test]
fn deleting_an_operand_blocks_the_operator() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    t.value("B", 6);
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(11));

    t.delete(&a);
    t.wait_status(&x, Status::Blocked);

    t.value("A", 1);
    t.wait_result(&x, json!(7));
}

#[test]
fn deleting_everything_leaves_no_state() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    let b = t.value("B", 6);
    let x = t.operator("X", "ADD", &["A", "B"]);
    t.wait_result(&x, json!(11));

    t.delete(&x);
    t.delete(&a);
    t.delete(&b);
    for name in ["A", "B"] {
        t.wait_gone(&ObjectId::new(testing::VALUE_STATE, NS, name));
    }
    t.wait_gone(&ObjectId::new(testing::OPERATOR_STATE, NS, "X"));
    t.settle();
    assert!(t.internal_objects().is_empty());
    assert_eq!(t.namespace_lock(), None);
}

#[test]
fn deleting_a_publisher_removes_the_published_value() {
    let t = TestEngine::new();
    t.value("A", 5);
    let x = t.operator_spec(
        "X",
        json!({ "operator": "ADD", "operands": ["A"], "publish": "C" }),
    );
    let c = TestEngine::value_id("C");
    t.wait_result(&x, json!(5));
    t.wait_result(&c, json!(5));

    t.delete(&x);
    t.wait_gone(&c);
    t.wait_gone(&ObjectId::new(testing::VALUE_STATE, NS, "C"));
}

#[test]
fn recreate_after_delete() {
    let t = TestEngine::new();
    let a = t.value("A", 5);
    t.wait_result(&a, json!(5));
    t.delete(&a);
    t.value("A", 8);
    t.wait_result(&a, json!(8));
    t.settle();
    assert_eq!(
        t.internal_objects(),
        vec![ObjectId::new(testing::VALUE_STATE, NS, "A")]
    );
}
