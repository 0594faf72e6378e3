//! Keyed Mutex Tests
//!
//! Exclusion per key, independence across keys and FIFO handoff.

use converge::{Context, ElementLocks, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn one_holder_per_key() {
    let locks = Arc::new(ElementLocks::<u32>::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let ctx = Context::background();
                barrier.wait();
                for _ in 0..100 {
                    locks.lock(&ctx, &7).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locks.unlock(&7);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!locks.is_locked(&7));
}

#[test]
fn different_keys_do_not_block() {
    let locks = ElementLocks::<&'static str>::new();
    assert!(locks.try_lock(&"a"));
    assert!(locks.try_lock(&"b"));
    assert!(!locks.try_lock(&"a"));
    locks.unlock(&"a");
    locks.unlock(&"b");
}

#[test]
fn waiters_are_served_in_arrival_order() {
    let mutex = Arc::new(Mutex::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    assert!(mutex.try_lock());

    let mut handles = Vec::new();
    for i in 0..4 {
        let waiter = Arc::clone(&mutex);
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            waiter.lock(&Context::background()).unwrap();
            order.lock().push(i);
            waiter.unlock();
        }));
        // Let waiter i queue before waiter i + 1.
        while !mutex.has_waiting() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
    }

    mutex.unlock();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn cancelled_waiter_gives_up_and_others_proceed() {
    let mutex = Arc::new(Mutex::new());
    assert!(mutex.try_lock());

    let ctx = Context::background().with_cancel();
    let waiter = {
        let mutex = Arc::clone(&mutex);
        let ctx = ctx.clone();
        thread::spawn(move || mutex.lock(&ctx))
    };
    while !mutex.has_waiting() {
        thread::sleep(Duration::from_millis(1));
    }
    ctx.cancel();
    assert!(waiter.join().unwrap().is_err());
    assert!(!mutex.has_waiting());

    mutex.unlock();
    assert!(mutex.try_lock());
    mutex.unlock();
}
