//! The hierarchical bucket timer set (spec.md §4.1).
//!
//! Sixty-five ordered sublists ("buckets"), indexed by the position of the
//! most significant differing bit between a timer's deadline and the set's
//! last drain timestamp. Close-to-`last` deadlines land in low-index
//! buckets (fine-grained, few timers); far-future deadlines land in
//! high-index buckets (coarse). A 65-bit bitmap of non-empty buckets gives
//! O(1) min/max bucket lookup via `leading_zeros`/`trailing_zeros`.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::timer::TimerInner;

const N_BUCKETS: usize = 65;
const OVERDUE_BUCKET: usize = N_BUCKETS - 1;

type Timestamp = u64;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Converts an `Instant` into the `u64` nanosecond timestamp the bucket
/// algorithm operates on, relative to a process-wide origin captured on
/// first use.
fn timestamp(t: Instant) -> Timestamp {
    let origin = *ORIGIN.get_or_init(Instant::now);
    t.checked_duration_since(origin)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as Timestamp
}

fn instant_from_timestamp(ts: Timestamp) -> Instant {
    let origin = *ORIGIN.get_or_init(Instant::now);
    origin + Duration::from_nanos(ts)
}

/// The indexed collection of pending timers.
pub(crate) struct TimerSet {
    buckets: Vec<Vec<Arc<TimerInner>>>,
    bitmap: u128,
    last: Timestamp,
    next: Timestamp,
    clock: Arc<dyn Clock>,
}

impl TimerSet {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        TimerSet {
            buckets: (0..N_BUCKETS).map(|_| Vec::new()).collect(),
            bitmap: 0,
            last: 0,
            next: Timestamp::MAX,
            clock,
        }
    }

    fn get_index(&self, ts: Timestamp) -> usize {
        if ts <= self.last {
            OVERDUE_BUCKET
        } else {
            (ts ^ self.last).leading_zeros() as usize
        }
    }

    fn highest_nonempty_bucket(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(127 - self.bitmap.leading_zeros() as usize)
        }
    }

    /// Insert `timer` (which must carry a valid `expiry`). Returns `true`
    /// iff the set's earliest pending deadline strictly decreased, which
    /// tells the manager it must re-arm the kernel timer.
    pub(crate) fn insert(&mut self, timer: Arc<TimerInner>) -> bool {
        let ts = timestamp(timer.expiry());
        let idx = self.get_index(ts);

        timer.state.lock().unwrap().bucket_index = Some(idx);
        self.buckets[idx].push(timer);
        self.bitmap |= 1u128 << idx;

        if ts < self.next {
            self.next = ts;
            true
        } else {
            false
        }
    }

    /// Remove `timer` from the set; a no-op if it is not present.
    pub(crate) fn remove(&mut self, timer: &Arc<TimerInner>) {
        let idx = match timer.state.lock().unwrap().bucket_index.take() {
            Some(idx) => idx,
            None => return,
        };

        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.iter().position(|t| Arc::ptr_eq(t, timer)) {
            bucket.remove(pos);
        }
        if bucket.is_empty() {
            self.bitmap &= !(1u128 << idx);
        }
    }

    /// Extract and return every timer whose deadline is `<= now`, leaving
    /// the remainder intact. Aborts the process if `now` precedes the
    /// timestamp of the previous drain (a monotonicity violation).
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Arc<TimerInner>> {
        let ts = timestamp(now);
        if ts < self.last {
            // Monotonicity violation: the clock must never regress
            // between drain passes. Unrecoverable per spec.md §7.
            std::process::abort();
        }

        let idx = self.get_index(ts);
        let mut expired = Vec::new();

        for i in (idx + 1)..N_BUCKETS {
            if self.bitmap & (1u128 << i) != 0 {
                let bucket = std::mem::take(&mut self.buckets[i]);
                for t in &bucket {
                    t.state.lock().unwrap().bucket_index = None;
                }
                expired.extend(bucket);
                self.bitmap &= !(1u128 << i);
            }
        }

        let mut to_reinsert = Vec::new();
        if self.bitmap & (1u128 << idx) != 0 {
            let bucket = std::mem::take(&mut self.buckets[idx]);
            self.bitmap &= !(1u128 << idx);
            for t in bucket {
                if t.expiry() <= now {
                    t.state.lock().unwrap().bucket_index = None;
                    expired.push(t);
                } else {
                    to_reinsert.push(t);
                }
            }
        }

        self.last = ts;
        for t in to_reinsert {
            self.insert(t);
        }

        self.next = Timestamp::MAX;
        if let Some(hi) = self.highest_nonempty_bucket() {
            if let Some(min_ts) = self.buckets[hi].iter().map(|t| timestamp(t.expiry())).min() {
                self.next = min_ts;
            }
        }

        expired
    }

    /// The greater of the last drain timestamp and the cached earliest
    /// candidate: the deadline the kernel timer should be armed to.
    pub(crate) fn get_next_timeout(&self) -> Instant {
        instant_from_timestamp(self.last.max(self.next))
    }

    pub(crate) fn size(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub(crate) fn clear(&mut self) {
        for bucket in &mut self.buckets {
            for t in bucket.drain(..) {
                t.state.lock().unwrap().bucket_index = None;
            }
        }
        self.bitmap = 0;
        self.next = Timestamp::MAX;
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::Disposer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn make_timer(clock: &Arc<dyn Clock>, at: Instant) -> Arc<TimerInner> {
        let t = TimerInner::new(Arc::new(|| {}), Disposer::CallerOwned, clock.now());
        t.state.lock().unwrap().expiry = at;
        t.state.lock().unwrap().armed = true;
        t
    }

    #[test]
    fn insert_reports_earliest_decrease() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let mut set = TimerSet::new(clock.clone());
        let now = clock.now();

        let a = make_timer(&clock, now + Duration::from_millis(20));
        assert!(set.insert(a));

        let b = make_timer(&clock, now + Duration::from_millis(5));
        assert!(set.insert(b));

        let c = make_timer(&clock, now + Duration::from_millis(10));
        assert!(!set.insert(c));
    }

    #[test]
    fn expire_returns_only_due_timers_in_order_independent_fashion() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let mut set = TimerSet::new(clock.clone());
        let now = clock.now();

        let near = make_timer(&clock, now + Duration::from_millis(1));
        let far = make_timer(&clock, now + Duration::from_secs(10));
        set.insert(near.clone());
        set.insert(far.clone());

        let expired = set.expire(now + Duration::from_millis(2));
        assert_eq!(expired.len(), 1);
        assert!(Arc::ptr_eq(&expired[0], &near));
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let mut set = TimerSet::new(clock.clone());
        let t = make_timer(&clock, clock.now() + Duration::from_secs(1));
        set.remove(&t);
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn mass_expiry_accounts_for_every_timer() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let mut set = TimerSet::new(clock.clone());
        let now = clock.now();
        let count = 1000usize;
        let seen = Arc::new(AtomicUsize::new(0));

        for i in 0..count {
            let t = make_timer(&clock, now + Duration::from_micros((i as u64 + 1) * 50));
            set.insert(t);
        }

        let expired = set.expire(now + Duration::from_millis(100));
        seen.fetch_add(expired.len(), Ordering::SeqCst);
        assert_eq!(seen.load(Ordering::SeqCst), count);
        assert!(set.is_empty());
    }
}
