//! Future and EventManager Tests
//!
//! Triggers delivered across threads.

use converge::{Context, EventManager, Future};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::common::ctx;

#[test]
fn trigger_from_another_thread_wakes_waiter() {
    let future = Future::once();
    let trigger = {
        let future = Arc::clone(&future);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            future.trigger();
        })
    };
    assert!(future.wait(&ctx()));
    trigger.join().unwrap();
    // Stays fired for later waiters.
    assert!(future.wait(&Context::background()));
}

#[test]
fn every_trigger_wakes_one_wait() {
    let future = Future::retriggerable();
    let waiter = {
        let future = Arc::clone(&future);
        thread::spawn(move || (0..20).filter(|_| future.wait(&ctx())).count())
    };
    for _ in 0..20 {
        future.trigger();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(waiter.join().unwrap(), 20);
}

#[test]
fn event_manager_reaches_all_waiters_of_one_id() {
    let events = Arc::new(EventManager::<String, &'static str>::new());
    let futures: Vec<_> = (0..4)
        .map(|_| events.future("done", "x".to_string()))
        .collect();
    let other = events.future("done", "y".to_string());

    let waiters: Vec<_> = futures
        .into_iter()
        .map(|f| thread::spawn(move || f.wait(&ctx())))
        .collect();
    assert_eq!(events.trigger(&"done", &"x".to_string()), 4);
    for w in waiters {
        assert!(w.join().unwrap());
    }

    let short = Context::background().with_timeout(Duration::from_millis(20));
    assert!(!other.wait(&short));
}

#[test]
fn dropped_futures_are_not_triggered() {
    let events = EventManager::<u32, u32>::new();
    drop(events.future(1, 1));
    assert_eq!(events.trigger(&1, &1), 0);
    assert!(events.is_empty());
}
