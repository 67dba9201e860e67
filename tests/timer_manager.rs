//! End-to-end scenarios against the public API, one process-wide manager
//! shared across the whole test binary (reset between tests since it is
//! process-global state).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hrtimer::{Timer, TimerManager, WorkerPool};

#[test]
fn cancellation_wins_the_race_with_a_near_deadline() {
    TimerManager::reset_for_test();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();

    let t = Timer::new(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });
    t.arm(Duration::from_millis(2));
    let cancelled = t.cancel();

    std::thread::sleep(Duration::from_millis(50));

    // Either the cancel wins (nothing fires) or the firing had already
    // been dispatched before cancel took effect (fires exactly once);
    // it must never double-fire.
    let count = fired.load(Ordering::SeqCst);
    assert!(count <= 1, "timer fired {count} times");
    if !cancelled {
        assert_eq!(count, 0, "cancel() returned false but claims it was never armed");
    }
}

#[test]
fn timer_fires_when_dispatched_through_a_worker_pool() {
    TimerManager::reset_for_test();
    let manager = TimerManager::instance();
    let pool = Arc::new(WorkerPool::with_max_idle(2));
    manager.set_worker_pool(pool);

    let (tx, rx) = std::sync::mpsc::channel();
    let t = Timer::new(move || {
        let _ = tx.send(std::thread::current().id());
    });
    t.arm(Duration::from_millis(5));

    let worker_thread = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_ne!(worker_thread, std::thread::current().id());
}

#[test]
fn rearm_replaces_a_pending_deadline() {
    TimerManager::reset_for_test();
    let order = Arc::new(Mutex::new(Vec::new()));
    let order2 = order.clone();

    let t = Timer::new(move || order2.lock().unwrap().push("fired"));
    t.arm(Duration::from_millis(200));
    t.rearm(Duration::from_millis(5));

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(*order.lock().unwrap(), vec!["fired"]);
}

#[test]
fn dropping_an_armed_timer_prevents_it_from_firing() {
    TimerManager::reset_for_test();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();

    {
        let t = Timer::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        t.arm(Duration::from_millis(30));
    }

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
