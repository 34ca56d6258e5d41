//! Deadline timers kept in an ordered set, harvested by the reactor's idle
//! loop.
//!
//! Deadlines are absolute milliseconds on the raw monotonic clock. The set
//! is keyed `(deadline, id)` so equal deadlines stay distinct and pop in
//! creation order. A manager embedded in an I/O reactor passes a `on_front`
//! hook that interrupts `epoll_wait` whenever a new timer becomes the
//! earliest one.

use crate::util::current_ms;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Shared, re-runnable timer callback. Recurring timers fire it once per
/// period; the scheduler receives a clone per firing.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// A single (possibly recurring) deadline.
///
/// Handles are returned by [`TimerManager::add_timer`]; dropping the handle
/// does not cancel the timer.
pub struct Timer {
    id: u64,
    /// Period in ms. Mutated only under the manager write lock.
    ms: AtomicU64,
    /// Absolute deadline in ms. Mutated only under the manager write lock,
    /// always together with the set key.
    next: AtomicU64,
    recurring: bool,
    cb: TimerCallback,
    /// Unowned back-reference; a manager outlives every timer it contains.
    manager: Weak<Shared>,
}

impl Timer {
    /// Remove the timer from its manager. Returns false if it already
    /// fired, was cancelled, or the manager is gone.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.timers.write();
        timers
            .remove(&(self.next.load(Ordering::Relaxed), self.id))
            .is_some()
    }

    /// Push the deadline out to now + period. Returns false if the timer is
    /// no longer pending.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.timers.write();
        let Some(timer) = timers.remove(&(self.next.load(Ordering::Relaxed), self.id)) else {
            return false;
        };
        let next = current_ms() + self.ms.load(Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
        timers.insert((next, self.id), timer);
        true
    }

    /// Change the period. `from_now` restarts the countdown from the
    /// current instant; otherwise the original start point is kept.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let notify;
        {
            let mut timers = shared.timers.write();
            let old_next = self.next.load(Ordering::Relaxed);
            let Some(timer) = timers.remove(&(old_next, self.id)) else {
                return false;
            };
            let start = if from_now {
                current_ms()
            } else {
                old_next - self.ms.load(Ordering::Relaxed)
            };
            self.ms.store(ms, Ordering::Relaxed);
            self.next.store(start + ms, Ordering::Relaxed);
            notify = insert_checked(&mut timers, (start + ms, self.id), timer, &shared);
        }
        if notify {
            (shared.on_front)();
        }
        true
    }
}

struct Shared {
    timers: RwLock<BTreeMap<(u64, u64), Arc<Timer>>>,
    /// Invoked (outside the lock) when an insertion produced a new earliest
    /// deadline; latched until the next `next_timer` call.
    on_front: Box<dyn Fn() + Send + Sync>,
    tickled: AtomicBool,
    /// Previous clock sample, for rollover detection.
    previous_time: AtomicU64,
}

/// Ordered set of deadlines with expiry harvesting and clock-rollover
/// detection.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    /// `on_front` fires whenever a newly inserted timer becomes the
    /// earliest deadline (coalesced until the next [`next_timer`] call).
    /// Pass a no-op when nothing waits on the timer horizon.
    ///
    /// [`next_timer`]: TimerManager::next_timer
    pub fn new<F>(on_front: F) -> TimerManager
    where
        F: Fn() + Send + Sync + 'static,
    {
        TimerManager {
            shared: Arc::new(Shared {
                timers: RwLock::new(BTreeMap::new()),
                on_front: Box::new(on_front),
                tickled: AtomicBool::new(false),
                previous_time: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `cb` to run `ms` milliseconds from now, repeatedly if
    /// `recurring`.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_arc(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`], but the callback is skipped (and the timer
    /// dropped) when `cond` can no longer be upgraded at fire time.
    ///
    /// [`add_timer`]: TimerManager::add_timer
    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let guarded = move || {
            if cond.upgrade().is_some() {
                cb();
            }
        };
        self.add_timer_arc(ms, Arc::new(guarded), recurring)
    }

    fn add_timer_arc(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let next = current_ms() + ms;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            ms: AtomicU64::new(ms),
            next: AtomicU64::new(next),
            recurring,
            cb,
            manager: Arc::downgrade(&self.shared),
        });
        let notify = {
            let mut timers = self.shared.timers.write();
            insert_checked(&mut timers, (next, timer.id), timer.clone(), &self.shared)
        };
        if notify {
            (self.shared.on_front)();
        }
        timer
    }

    /// Milliseconds until the earliest deadline: `Some(0)` when already
    /// due, `None` when no timer is pending. Re-arms the front
    /// notification latch.
    pub fn next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Relaxed);
        let timers = self.shared.timers.read();
        let (&(next, _), _) = timers.iter().next()?;
        let now = current_ms();
        Some(next.saturating_sub(now))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().is_empty()
    }

    /// Pop every timer whose deadline has passed and return its callback;
    /// recurring timers are re-inserted at `now + period`. If the
    /// monotonic clock appears to have jumped backwards by more than an
    /// hour, every timer is treated as due.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = current_ms();
        let mut expired = Vec::new();
        let mut timers = self.shared.timers.write();
        let rollover = self.detect_clock_rollover(now);
        if timers.is_empty() {
            return expired;
        }
        if !rollover
            && timers
                .first_key_value()
                .is_none_or(|(&(next, _), _)| next > now)
        {
            return expired;
        }
        let due: Vec<(u64, u64)> = if rollover {
            timers.keys().copied().collect()
        } else {
            timers.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect()
        };
        for key in due {
            let timer = timers.remove(&key).expect("due timer vanished under the write lock");
            expired.push(timer.cb.clone());
            if timer.recurring {
                // Re-arm relative to now, not the old deadline: periods are
                // measured between firings, not accumulated as drift.
                let next = now + timer.ms.load(Ordering::Relaxed);
                timer.next.store(next, Ordering::Relaxed);
                timers.insert((next, timer.id), timer);
            }
        }
        expired
    }

    /// True when the clock sample went backwards by more than an hour since
    /// the previous sample. Absorbs wall-clock corrections that leak into
    /// the monotonic reading on some kernels.
    fn detect_clock_rollover(&self, now: u64) -> bool {
        let prev = self.shared.previous_time.swap(now, Ordering::Relaxed);
        now < prev && now < prev.saturating_sub(60 * 60 * 1000)
    }
}

/// Insert under the caller's write lock; true when the newcomer is the new
/// minimum and the front latch was not already set. The caller invokes
/// `on_front` after releasing the lock.
fn insert_checked(
    timers: &mut BTreeMap<(u64, u64), Arc<Timer>>,
    key: (u64, u64),
    timer: Arc<Timer>,
    shared: &Shared,
) -> bool {
    timers.insert(key, timer);
    let at_front = timers
        .first_key_value()
        .map(|(k, _)| *k == key)
        .unwrap_or(false);
    at_front && !shared.tickled.swap(true, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn expired_timers_pop_in_deadline_order() {
        let mgr = TimerManager::new(|| {});
        let fired = Arc::new(AtomicUsize::new(0));
        for ms in [30u64, 10, 20] {
            let fired = fired.clone();
            mgr.add_timer(ms, move || {
                fired.fetch_add(1, Ordering::Relaxed);
            }, false);
        }
        assert!(mgr.has_timer());
        assert!(mgr.next_timer().unwrap() <= 10);

        std::thread::sleep(std::time::Duration::from_millis(50));
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            (*cb)();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn condition_timer_skips_after_condition_drops() {
        let mgr = TimerManager::new(|| {});
        let fired = Arc::new(AtomicBool::new(false));
        let cond: Arc<dyn Any + Send + Sync> = Arc::new(0u32);
        {
            let fired = fired.clone();
            mgr.add_condition_timer(
                5,
                move || fired.store(true, Ordering::Relaxed),
                Arc::downgrade(&cond),
                false,
            );
        }
        drop(cond);
        std::thread::sleep(std::time::Duration::from_millis(10));
        for cb in mgr.list_expired() {
            (*cb)();
        }
        assert!(!fired.load(Ordering::Relaxed));
    }

    #[test]
    fn recurring_timer_reinserts_from_now() {
        let mgr = TimerManager::new(|| {});
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            mgr.add_timer(10, move || {
                fired.fetch_add(1, Ordering::Relaxed);
            }, true);
        }
        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(15));
            for cb in mgr.list_expired() {
                (*cb)();
            }
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert!(mgr.has_timer());
    }

    #[test]
    fn cancel_refresh_reset() {
        let mgr = TimerManager::new(|| {});
        let timer = mgr.add_timer(1_000, || {}, false);
        assert!(timer.refresh());
        assert!(timer.reset(2_000, true));
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn front_insert_notifies_once_until_rearmed() {
        let notified = Arc::new(AtomicUsize::new(0));
        let mgr = {
            let notified = notified.clone();
            TimerManager::new(move || {
                notified.fetch_add(1, Ordering::Relaxed);
            })
        };
        mgr.add_timer(1_000, || {}, false);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
        // Not at the front: no notification.
        mgr.add_timer(5_000, || {}, false);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
        // New front, but the latch is still set until next_timer re-arms it.
        mgr.add_timer(500, || {}, false);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
        let _ = mgr.next_timer();
        mgr.add_timer(100, || {}, false);
        assert_eq!(notified.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn clock_rollover_expires_everything_once() {
        let mgr = TimerManager::new(|| {});
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            mgr.add_timer(60_000, move || {
                fired.fetch_add(1, Ordering::Relaxed);
            }, false);
        }
        // Pretend the previous sample was far in the future: the next
        // harvest sees a > 1h backward jump.
        mgr.shared
            .previous_time
            .store(current_ms() + 2 * 60 * 60 * 1000, Ordering::Relaxed);
        let cbs = mgr.list_expired();
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            (*cb)();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        // The sample is back to normal; nothing fires twice.
        assert!(mgr.list_expired().is_empty());
        assert!(!mgr.has_timer());
    }
}
