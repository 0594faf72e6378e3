//! Store Compare-and-Set Tests
//!
//! Concurrent read-modify-write through `modify` never loses an update.

use converge::{
    ExternalState, MemoryStore, NamespaceState, ObjectData, ObjectId, ObjectStore, RetryConfig,
    RunId, StoredObject,
};
use converge_storage::modify;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::common::{json, ExternalStatus};

fn counter_id() -> ObjectId {
    ObjectId::new("Value", "calc", "counter")
}

#[test]
fn concurrent_modify_loses_no_update() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_object(StoredObject::new(
            counter_id(),
            ObjectData::External(ExternalState::new(json!({ "value": 0 }))),
        ))
        .unwrap();

    let retry = RetryConfig::new().with_max_retries(10_000).with_max_delay_ms(1);
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let retry = retry.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let mut obj = store.get_object(&counter_id()).unwrap();
                    modify(store.as_ref(), &mut obj, &retry, |data| match data {
                        ObjectData::External(ext) => {
                            let n = ext.spec["value"].as_i64().unwrap_or(0);
                            ext.spec = json!({ "value": n + 1 });
                            ((), true)
                        }
                        _ => ((), false),
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let obj = store.get_object(&counter_id()).unwrap();
    let ext = obj.as_external().unwrap();
    assert_eq!(ext.spec, json!({ "value": 400 }));
    assert_eq!(ext.status, ExternalStatus::default());
}

#[test]
fn only_one_thread_takes_a_namespace_lock() {
    let store = Arc::new(MemoryStore::new());
    let id = ObjectId::new("Namespace", "", "calc");
    store
        .create_object(StoredObject::new(
            id.clone(),
            ObjectData::Namespace(NamespaceState::default()),
        ))
        .unwrap();

    let winners = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let id = id.clone();
            let winners = Arc::clone(&winners);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut obj = store.get_object(&id).unwrap();
                barrier.wait();
                let run = RunId::new();
                if obj.as_namespace_mut().unwrap().try_lock(run) && store.set_object(&obj).is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let obj = store.get_object(&id).unwrap();
    assert!(obj.as_namespace().unwrap().run_lock.is_some());
}
