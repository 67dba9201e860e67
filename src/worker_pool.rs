//! The elastic worker pool (spec.md §4.3).
//!
//! Workers are not created eagerly. Each `submit` spawns a new worker only
//! when no worker is currently waiting and the pool is below its cap of
//! `2 * max_idle + 1` live workers; otherwise the task relies on an
//! existing worker being woken. Grounded on the original's
//! `std::condition_variable`/`waiters` bookkeeping (`thread_pool.hh`).

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Result, TimerError};

type Task = Box<dyn FnOnce() + Send + 'static>;
type AtExitHook = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    stop: AtomicBool,
    waiters: AtomicUsize,
    worker_count: Mutex<usize>,
    max_idle: usize,
    at_exit: Mutex<VecDeque<AtExitHook>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A pool of worker threads that runs submitted callbacks off the
/// expiry-drain thread, growing to demand up to a hard cap.
pub struct WorkerPool {
    shared: std::sync::Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool whose idle cap defaults to the machine's hardware
    /// parallelism (at least 1); the hard cap on live workers is
    /// `2 * max_idle + 1`.
    pub fn new() -> Self {
        let max_idle = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(1);
        Self::with_max_idle(max_idle)
    }

    /// Create a pool with an explicit idle cap (ambient configuration
    /// supplement — spec.md hardwires hardware parallelism, but tests
    /// benefit from a small, deterministic cap).
    pub fn with_max_idle(max_idle: usize) -> Self {
        WorkerPool {
            shared: std::sync::Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                stop: AtomicBool::new(false),
                waiters: AtomicUsize::new(0),
                worker_count: Mutex::new(0),
                max_idle: max_idle.max(1),
                at_exit: Mutex::new(VecDeque::new()),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The hard cap on simultaneously-live workers.
    fn cap(&self) -> usize {
        2 * self.shared.max_idle + 1
    }

    /// Enqueue `task`. Returns a [`JoinFuture`] resolving to its return
    /// value, or an error if the pool has already been stopped.
    pub fn submit<F, T>(&self, task: F) -> Result<JoinFuture<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = std::sync::Arc::new(CompletionSlot::<T>::new());
        let slot_for_worker = slot.clone();

        {
            let mut queue = self.shared.queue.lock().unwrap();
            if self.shared.stop.load(Ordering::SeqCst) {
                return Err(TimerError::PoolStopped);
            }

            queue.push_back(Box::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(task));
                slot_for_worker.complete(result);
            }));

            self.maybe_spawn_worker();
        }
        self.shared.condvar.notify_one();

        Ok(JoinFuture { slot })
    }

    /// Run a task inline on the current thread, bypassing the queue.
    /// Used by the manager when no pool is configured, or the pool has
    /// already been stopped.
    pub fn run_inline(task: impl FnOnce() + Send + 'static) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            log::warn!("timer callback panicked (inline dispatch): {:?}", describe_panic(&payload));
        }
    }

    fn maybe_spawn_worker(&self) {
        if self.shared.waiters.load(Ordering::SeqCst) > 0 {
            return;
        }
        let mut count = self.shared.worker_count.lock().unwrap();
        if *count >= self.cap() {
            return;
        }
        *count += 1;
        drop(count);

        let shared = self.shared.clone();
        let handle = thread::spawn(move || worker_loop(shared));
        self.shared.handles.lock().unwrap().push(handle);
    }

    /// Register a hook to run once, in submission order, during shutdown
    /// before workers are joined.
    pub fn at_exit(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.at_exit.lock().unwrap().push_back(Box::new(hook));
    }

    /// Whether the pool has been stopped.
    pub fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Stop the pool: run at-exit hooks, wake and join every worker.
    /// Submission after this call fails with [`TimerError::PoolStopped`].
    pub fn shutdown(&self) {
        {
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.stop.store(true, Ordering::SeqCst);
        }

        let hooks: Vec<_> = self.shared.at_exit.lock().unwrap().drain(..).collect();
        for hook in hooks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
                log::warn!("at_exit hook panicked: {:?}", describe_panic(&payload));
            }
        }

        self.shared.condvar.notify_all();

        let handles: Vec<_> = self.shared.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: std::sync::Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            shared.waiters.fetch_add(1, Ordering::SeqCst);
            while !shared.stop.load(Ordering::SeqCst) && queue.is_empty() {
                queue = shared.condvar.wait(queue).unwrap();
            }
            shared.waiters.fetch_sub(1, Ordering::SeqCst);

            if shared.stop.load(Ordering::SeqCst) && queue.is_empty() {
                None
            } else {
                queue.pop_front()
            }
        };

        match task {
            Some(task) => task(),
            None => break,
        }
    }

    *shared.worker_count.lock().unwrap() -= 1;
}

fn describe_panic(payload: &Box<dyn std::any::Any + Send>) -> &'static str {
    if payload.downcast_ref::<&str>().is_some() || payload.downcast_ref::<String>().is_some() {
        "panicked with a message"
    } else {
        "panicked with a non-string payload"
    }
}

struct CompletionSlot<T> {
    state: Mutex<Option<std::thread::Result<T>>>,
    condvar: Condvar,
}

impl<T> CompletionSlot<T> {
    fn new() -> Self {
        CompletionSlot {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    fn complete(&self, result: std::thread::Result<T>) {
        let mut state = self.state.lock().unwrap();
        *state = Some(result);
        self.condvar.notify_all();
    }
}

/// A blocking handle to a submitted task's eventual result.
///
/// Matches the original's `std::future` (itself blocking, not async):
/// spec.md explicitly scopes out cooperative/async suspension points, so
/// this is a `Mutex` + `Condvar` completion slot rather than a futures
/// executor.
pub struct JoinFuture<T> {
    slot: std::sync::Arc<CompletionSlot<T>>,
}

impl<T> JoinFuture<T> {
    /// Block until the task completes, returning its output or the
    /// panic payload it propagated.
    pub fn wait(self) -> std::thread::Result<T> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            if let Some(result) = state.take() {
                return result;
            }
            state = self.slot.condvar.wait(state).unwrap();
        }
    }

    /// Non-blocking poll: `None` if the task has not completed yet.
    pub fn try_get(&self) -> Option<std::thread::Result<T>> {
        self.slot.state.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn submit_runs_task_and_resolves_future() {
        let pool = WorkerPool::with_max_idle(2);
        let future = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(future.wait().unwrap(), 42);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::with_max_idle(1);
        pool.shutdown();
        assert!(pool.stopped());
        match pool.submit(|| ()) {
            Err(TimerError::PoolStopped) => {}
            other => panic!("expected PoolStopped, got {other:?}"),
        }
    }

    #[test]
    fn worker_count_never_exceeds_cap() {
        let pool = WorkerPool::with_max_idle(2);
        let cap = pool.cap();
        let barrier = Arc::new(std::sync::Barrier::new(1));
        let seen = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for _ in 0..(cap * 4) {
            let barrier = barrier.clone();
            let seen = seen.clone();
            futures.push(
                pool.submit(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                    let _ = &barrier;
                    thread::sleep(Duration::from_millis(1));
                })
                .unwrap(),
            );
        }
        for f in futures {
            f.wait().unwrap();
        }
        assert!(*pool.shared.worker_count.lock().unwrap() <= cap);
        assert_eq!(seen.load(Ordering::SeqCst), cap * 4);
    }

    #[test]
    fn at_exit_hooks_run_in_order_once() {
        let pool = WorkerPool::with_max_idle(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            pool.at_exit(move || order.lock().unwrap().push(i));
        }
        pool.shutdown();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_task_does_not_poison_pool() {
        let pool = WorkerPool::with_max_idle(1);
        let f1 = pool.submit(|| panic!("boom")).unwrap();
        assert!(f1.wait().is_err());

        let f2 = pool.submit(|| 7).unwrap();
        assert_eq!(f2.wait().unwrap(), 7);
    }
}
