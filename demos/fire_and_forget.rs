//! Dispatching `fire_after` calls from a pool of worker threads, with a
//! worker pool installed so timer callbacks run off the drain thread.

use std::sync::Arc;
use std::time::Duration;

use hrtimer::{Timer, TimerManager, WorkerPool};

fn main() {
    let pool = Arc::new(WorkerPool::new());
    let manager = TimerManager::instance();
    manager.set_worker_pool(pool.clone());

    let t3 = Timer::new(|| println!("t3 ------ timeout!"));
    t3.arm(Duration::from_micros(1000));

    let mut submissions = Vec::new();
    for i in 0..10 {
        let submission = pool.submit(move || {
            TimerManager::instance().fire_after(Duration::from_micros(1), move || {
                println!("timer:{i}");
            });
        });
        submissions.push(submission);
    }
    for submission in submissions.into_iter().flatten() {
        let _ = submission.wait();
    }

    std::thread::sleep(Duration::from_secs(1));
    println!("main end");
}
