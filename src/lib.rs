//! A high-resolution, process-wide timer facility.
//!
//! Three collaborating pieces: a hierarchical bucket [`TimerSet`] holding
//! pending deadlines, a singleton [`TimerManager`] that arbitrates it and
//! drains due timers on a background thread woken by a kernel timer, and an
//! elastic [`WorkerPool`] that callbacks are dispatched onto.
//!
//! ```no_run
//! use std::time::Duration;
//! use hrtimer::Timer;
//!
//! let t = Timer::new(|| println!("fired"));
//! t.arm(Duration::from_millis(100));
//! # std::thread::sleep(Duration::from_millis(200));
//! ```

mod clock;
mod error;
mod kernel_timer;
mod manager;
mod timer;
mod timer_set;
mod worker_pool;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TimerError};
pub use manager::{ManagerConfig, TimerManager};
pub use timer::{Timer, TimerId};
pub use worker_pool::{JoinFuture, WorkerPool};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn out_of_order_arming_fires_in_deadline_order() {
        TimerManager::reset_for_test();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mk = |order: Arc<std::sync::Mutex<Vec<&'static str>>>, label: &'static str| {
            Timer::new(move || order.lock().unwrap().push(label))
        };

        let b = mk(order.clone(), "b");
        let c = mk(order.clone(), "c");
        let a = mk(order.clone(), "a");

        b.arm(Duration::from_millis(30));
        c.arm(Duration::from_millis(45));
        a.arm(Duration::from_millis(15));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn mass_fire_and_forget_all_run() {
        TimerManager::reset_for_test();
        let manager = TimerManager::instance();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..10_000 {
            let seen = seen.clone();
            manager.fire_after(Duration::from_micros(10), move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 10_000 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 10_000);
    }
}
