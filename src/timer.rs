//! The `Timer` entity and its state machine.
//!
//! States, as named in the specification: `Idle` (¬armed ∧ ¬queued ∧
//! ¬expired), `Pending` (armed ∧ queued ∧ ¬expired), `Expired` (armed ∧
//! ¬queued ∧ expired), `Fired` (¬armed ∧ ¬queued ∧ ¬expired, caller-owned
//! only). All mutable fields live behind one `Mutex<TimerState>` so a
//! transition never observes a half-updated timer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::manager::TimerManager;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically allocated timer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    pub(crate) fn next() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value of this id.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Who is responsible for releasing a timer's storage.
///
/// Caller-owned timers are held alive by the code that constructed them;
/// their `Drop` impl cancels if still queued. Self-owned timers are
/// created by `TimerManager::fire_after` and are released by the drain
/// pass after their terminal (necessarily non-periodic) firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposer {
    CallerOwned,
    SelfOwned,
}

pub(crate) struct TimerState {
    pub(crate) armed: bool,
    pub(crate) queued: bool,
    pub(crate) expired: bool,
    pub(crate) expiry: Instant,
    pub(crate) period: Option<Duration>,
    /// Which bucket of the timer set this timer currently sits in, if
    /// `queued`. Stands in for the intrusive list hook the original
    /// uses to unlink a timer in O(1) without rescanning every bucket.
    pub(crate) bucket_index: Option<usize>,
}

/// Internal, reference-counted timer storage.
///
/// Both the public [`Timer`] handle and the manager's timer set hold an
/// `Arc` to the same `TimerInner`; neither the set nor the manager ever
/// holds a direct pointer back, matching the "opaque handle, no cyclic
/// back-reference" redesign note.
pub(crate) struct TimerInner {
    pub(crate) id: TimerId,
    pub(crate) callback: Arc<dyn Fn() + Send + Sync + 'static>,
    pub(crate) state: Mutex<TimerState>,
    pub(crate) disposer: Disposer,
}

impl TimerInner {
    pub(crate) fn new(
        callback: Arc<dyn Fn() + Send + Sync + 'static>,
        disposer: Disposer,
        now: Instant,
    ) -> Arc<Self> {
        Arc::new(TimerInner {
            id: TimerId::next(),
            callback,
            state: Mutex::new(TimerState {
                armed: false,
                queued: false,
                expired: false,
                expiry: now,
                period: None,
                bucket_index: None,
            }),
            disposer,
        })
    }

    pub(crate) fn expiry(&self) -> Instant {
        self.state.lock().unwrap().expiry
    }
}

/// A caller-owned timer.
///
/// The caller must keep this value alive while the timer is armed; on
/// drop, a still-queued timer is cancelled (removed from the set) before
/// its storage is released, so a dropped `Timer` can never fire after the
/// drop returns.
pub struct Timer {
    pub(crate) inner: Arc<TimerInner>,
}

impl Timer {
    /// Create a new, unarmed timer wrapping `callback`.
    ///
    /// The callback may run on any worker thread and, for periodic
    /// timers, may run more than once; it must not block on the timer
    /// set's lock (see the manager's module docs for why that can
    /// deadlock on the inline-dispatch path).
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        let inner = TimerInner::new(
            Arc::new(callback),
            Disposer::CallerOwned,
            TimerManager::instance().clock_now(),
        );
        Timer { inner }
    }

    /// Arm the timer to fire once after `delta`.
    ///
    /// Precondition: the timer must not already be armed (`debug_assert`
    /// in debug builds, per the error handling design).
    pub fn arm(&self, delta: Duration) {
        let until = TimerManager::instance().clock_now() + delta;
        TimerManager::instance().arm(&self.inner, until, None);
    }

    /// Arm the timer for an absolute deadline, optionally periodic.
    pub fn arm_at(&self, until: Instant, period: Option<Duration>) {
        TimerManager::instance().arm(&self.inner, until, period);
    }

    /// Cancel if armed, then arm to fire once after `delta`.
    pub fn rearm(&self, delta: Duration) {
        let until = TimerManager::instance().clock_now() + delta;
        TimerManager::instance().rearm(&self.inner, until, None);
    }

    /// Cancel if armed, then arm for an absolute deadline.
    pub fn rearm_at(&self, until: Instant, period: Option<Duration>) {
        TimerManager::instance().rearm(&self.inner, until, period);
    }

    /// Arm to fire repeatedly every `period`, starting at `now + period`.
    pub fn arm_periodic(&self, period: Duration) {
        let until = TimerManager::instance().clock_now() + period;
        TimerManager::instance().arm(&self.inner, until, Some(period));
    }

    /// Cancel the timer. Idempotent: cancelling an already-cancelled or
    /// never-armed timer returns `false` without error.
    pub fn cancel(&self) -> bool {
        TimerManager::instance().cancel(&self.inner)
    }

    /// Whether the timer is currently scheduled to fire.
    pub fn armed(&self) -> bool {
        self.inner.state.lock().unwrap().armed
    }

    /// The timer's current deadline. Meaningful only while armed.
    pub fn get_timeout(&self) -> Instant {
        self.inner.expiry()
    }

    /// This timer's process-unique id.
    pub fn id(&self) -> TimerId {
        self.inner.id
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        TimerManager::instance().cancel(&self.inner);
    }
}
