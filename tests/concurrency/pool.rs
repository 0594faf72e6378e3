//! Pool Tests
//!
//! Per-key serialization and throughput with many keys and workers.

use converge_concurrency::{Action, Context, Pool, Status};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Records concurrent executions per key
#[derive(Default)]
struct Tracker {
    running: DashMap<u32, usize>,
    runs: DashMap<u32, usize>,
    overlaps: AtomicUsize,
}

impl Action<u32> for Tracker {
    fn reconcile(&self, _ctx: &Context, key: &u32) -> Status {
        {
            let mut running = self.running.entry(*key).or_insert(0);
            *running += 1;
            if *running > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        thread::sleep(Duration::from_micros(200));
        *self.runs.entry(*key).or_insert(0) += 1;
        if let Some(mut running) = self.running.get_mut(key) {
            *running -= 1;
        }
        Status::Completed(None)
    }
}

#[test]
fn one_key_never_runs_twice_at_once() {
    let pool = Pool::new("serialize");
    let tracker = Arc::new(Tracker::default());
    pool.start(8, tracker.clone()).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let handle = pool.handle();
            thread::spawn(move || {
                for i in 0..500 {
                    handle.enqueue(i % 5);
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    pool.drain();

    assert_eq!(tracker.overlaps.load(Ordering::SeqCst), 0);
    for key in 0..5 {
        assert!(tracker.runs.get(&key).map_or(0, |r| *r) >= 1);
    }
    pool.shutdown();
}

#[test]
fn many_keys_all_processed() {
    let pool = Pool::new("fanout");
    let tracker = Arc::new(Tracker::default());
    pool.start(4, tracker.clone()).unwrap();

    for key in 0..200 {
        pool.enqueue(key);
    }
    let handle = pool.handle();
    for key in 200..220 {
        handle.enqueue_after(key, Duration::from_millis(5));
    }
    pool.drain();

    assert_eq!(tracker.runs.len(), 220);
    let stats = pool.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.delayed, 0);
    assert_eq!(stats.failed, 0);
    pool.shutdown();
}

#[test]
fn workers_survive_panicking_actions() {
    struct Flaky(AtomicUsize);
    impl Action<u32> for Flaky {
        fn reconcile(&self, _ctx: &Context, key: &u32) -> Status {
            self.0.fetch_add(1, Ordering::SeqCst);
            if key % 2 == 0 {
                panic!("even key {}", key);
            }
            Status::Completed(None)
        }
    }

    let pool = Pool::new("flaky");
    let action = Arc::new(Flaky(AtomicUsize::new(0)));
    pool.start(2, action.clone()).unwrap();
    for key in 0..10 {
        pool.enqueue(key);
    }
    pool.drain();

    assert_eq!(action.0.load(Ordering::SeqCst), 10);
    let stats = pool.stats();
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.worker_count, 2);
    pool.shutdown();
}
