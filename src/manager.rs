//! The process-wide timer manager (spec.md §4.2).
//!
//! Owns the kernel timer, arbitrates access to the [`TimerSet`] through a
//! reader/writer lock, and runs one drain pass per kernel-timer signal on a
//! dedicated background thread. Caution (per spec.md's design notes):
//! callbacks must not call `arm`/`cancel` on the inline-dispatch path (pool
//! absent or stopped) — dispatch there happens on the calling thread,
//! which for the inline path is the drain thread itself, and `arm`/`cancel`
//! would re-enter the set's lock. The pooled dispatch path is safe because
//! it happens outside the lock, on a separate worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::kernel_timer::KernelTimer;
#[cfg(target_os = "linux")]
use crate::kernel_timer::LinuxTimerFd;
use crate::kernel_timer::PortableTimer;
use crate::timer::{Disposer, TimerInner};
use crate::timer_set::TimerSet;
use crate::worker_pool::WorkerPool;

/// Configuration for a [`TimerManager`], supplementing spec.md's hardwired
/// defaults (hardware-parallelism worker cap, real monotonic clock) with
/// override points tests need.
pub struct ManagerConfig {
    /// Clock to use; defaults to the real monotonic clock.
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig { clock: None }
    }
}

/// The process-wide timer coordinator.
///
/// Reachable only through [`TimerManager::instance`]; there is exactly one
/// live manager at a time, matching the "init-on-first-use, explicit
/// reset-for-tests" singleton design note.
pub struct TimerManager {
    clock: Arc<dyn Clock>,
    kernel_timer: Box<dyn KernelTimer>,
    set: RwLock<TimerSet>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

type CurrentCell = RwLock<&'static TimerManager>;
static CURRENT: OnceLock<CurrentCell> = OnceLock::new();

fn current_cell() -> &'static CurrentCell {
    CURRENT.get_or_init(|| RwLock::new(leak_new(ManagerConfig::default())))
}

fn leak_new(config: ManagerConfig) -> &'static TimerManager {
    Box::leak(Box::new(TimerManager::new(config)))
}

impl TimerManager {
    fn new(config: ManagerConfig) -> Self {
        let clock: Arc<dyn Clock> = config.clock.unwrap_or_else(|| Arc::new(SystemClock));

        #[cfg(target_os = "linux")]
        let kernel_timer: Box<dyn KernelTimer> = Box::new(
            LinuxTimerFd::new().expect("failed to create the kernel timer facility"),
        );
        #[cfg(not(target_os = "linux"))]
        let kernel_timer: Box<dyn KernelTimer> = Box::new(PortableTimer::new());

        TimerManager {
            set: RwLock::new(TimerSet::new(clock.clone())),
            clock,
            kernel_timer,
            pool: Mutex::new(None),
            drain_thread: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The single process-wide manager, created on first use.
    pub fn instance() -> &'static TimerManager {
        *current_cell().read().unwrap()
    }

    /// Shut down the current manager (joining its drain thread and
    /// worker pool, cancelling any remaining queued timers) and install
    /// a fresh one. The singleton is observable state across tests, so
    /// this hook exists to reset it between them; not meant for use
    /// outside test setup.
    pub fn reset_for_test() {
        let mut guard = current_cell().write().unwrap();
        guard.shutdown();
        *guard = leak_new(ManagerConfig::default());
    }

    /// Install the worker pool callbacks are dispatched to. Without one,
    /// callbacks run inline on the drain thread.
    pub fn set_worker_pool(&'static self, pool: Arc<WorkerPool>) {
        *self.pool.lock().unwrap() = Some(pool);
    }

    pub(crate) fn clock_now(&'static self) -> Instant {
        self.clock.now()
    }

    /// Create a self-owned timer and arm it to fire once after `delta`.
    /// Its storage is released by the drain pass after it fires.
    pub fn fire_after(&'static self, delta: Duration, callback: impl FnOnce() + Send + 'static) {
        let callback = Mutex::new(Some(callback));
        let action: Arc<dyn Fn() + Send + Sync + 'static> = Arc::new(move || {
            if let Some(f) = callback.lock().unwrap().take() {
                f();
            }
        });
        let inner = TimerInner::new(action, Disposer::SelfOwned, self.clock_now());
        let until = self.clock_now() + delta;
        self.arm(&inner, until, None);
    }

    /// Arm `timer` for an absolute `until`, optionally periodic.
    /// Precondition: the timer must not already be armed.
    pub(crate) fn arm(&'static self, timer: &Arc<TimerInner>, until: Instant, period: Option<Duration>) {
        {
            let mut state = timer.state.lock().unwrap();
            debug_assert!(!state.armed, "arm called on an already-armed timer");
            state.armed = true;
            state.queued = true;
            state.expired = false;
            state.expiry = until;
            state.period = period;
        }

        self.ensure_drain_thread();

        let mut set = self.set.write().unwrap();
        let decreased = set.insert(timer.clone());
        let next = set.get_next_timeout();
        drop(set);

        if decreased {
            if let Err(err) = self.kernel_timer.arm(next) {
                log::warn!("failed to re-arm kernel timer: {err}");
            }
        }
    }

    /// Cancel if armed, then arm for `until`/`period`; this loses cadence
    /// for a periodic timer mid-cycle (spec.md's design notes flag this
    /// as ambiguous in the original and direct this crate to follow it).
    pub(crate) fn rearm(&'static self, timer: &Arc<TimerInner>, until: Instant, period: Option<Duration>) {
        self.cancel(timer);
        self.arm(timer, until, period);
    }

    /// Cancel `timer`. Idempotent. Returns `true` iff it had been armed.
    pub(crate) fn cancel(&'static self, timer: &Arc<TimerInner>) -> bool {
        let mut state = timer.state.lock().unwrap();
        if !state.armed {
            return false;
        }
        state.armed = false;
        let was_queued = state.queued;
        state.queued = false;
        drop(state);

        if was_queued {
            let mut set = self.set.write().unwrap();
            set.remove(timer);
        }
        true
    }

    fn ensure_drain_thread(&'static self) {
        let mut guard = self.drain_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let handle = std::thread::Builder::new()
            .name("hrtimer-drain".to_string())
            .spawn(move || self.drain_loop())
            .expect("failed to spawn the timer drain thread");
        *guard = Some(handle);
    }

    fn drain_loop(&'static self) {
        loop {
            match self.kernel_timer.wait() {
                Ok(_count) => {
                    if self.shut_down.load(Ordering::SeqCst) {
                        return;
                    }
                    self.drain_once();
                }
                Err(err) => {
                    log::warn!("kernel timer wait failed: {err}");
                    if self.shut_down.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
    }

    /// One end-to-end drain pass: expire due timers, mark them expired,
    /// dispatch callbacks (re-arming periodic timers first), then re-arm
    /// the kernel timer to the new earliest deadline.
    fn drain_once(&'static self) {
        let now = self.clock_now();
        let expired = {
            let mut set = self.set.write().unwrap();
            set.expire(now)
        };

        for t in &expired {
            t.state.lock().unwrap().expired = true;
        }

        for t in expired {
            let mut state = t.state.lock().unwrap();
            state.queued = false;

            if !state.armed {
                // Cancelled concurrently between expiry and dispatch;
                // self-owned storage is released when `t` is dropped.
                continue;
            }

            let period = state.period;
            if let Some(period) = period {
                state.expiry = now + period;
                state.expired = false;
                state.queued = true;
                drop(state);
                let mut set = self.set.write().unwrap();
                set.insert(t.clone());
                drop(set);
            } else {
                state.armed = false;
                drop(state);
            }

            let callback = t.callback.clone();
            let pool = self.pool.lock().unwrap().clone();
            match pool {
                Some(pool) if !pool.stopped() => {
                    if let Err(err) = pool.submit(move || (callback)()) {
                        log::warn!("failed to submit expired timer callback: {err}");
                        WorkerPool::run_inline(move || (callback)());
                    }
                }
                _ => WorkerPool::run_inline(move || (callback)()),
            }
        }

        let set = self.set.read().unwrap();
        if !set.is_empty() {
            let next = set.get_next_timeout();
            drop(set);
            if let Err(err) = self.kernel_timer.arm(next) {
                log::warn!("failed to re-arm kernel timer after drain: {err}");
            }
        }
    }

    /// Join the drain thread, cancel any remaining queued timers, and
    /// shut down the worker pool. Called automatically by
    /// [`TimerManager::reset_for_test`]; production processes may call
    /// it explicitly for deterministic teardown since `'static` values
    /// are not otherwise dropped at process exit.
    pub fn shutdown(&'static self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let _ = self.kernel_timer.arm(self.clock_now());

        if let Some(handle) = self.drain_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.set.write().unwrap().clear();

        if let Some(pool) = self.pool.lock().unwrap().take() {
            pool.shutdown();
        }
    }
}
