//! Deadline-ordered timers.
//!
//! [`TimerQueue`] keeps timers sorted by absolute deadline (milliseconds on a
//! process-local monotonic clock) and hands expired callbacks to whoever
//! polls it. The reactor installs a wake hook that fires when an insertion
//! becomes the new earliest deadline, so its poll loop can re-shorten the
//! sleep it is currently in.
//!
//! Recurring timers are re-stamped `now + period` when they expire. A timer
//! that takes longer than one period to service does not accumulate missed
//! deadlines.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

/// Milliseconds since the first call in this process. Monotonic.
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Callback run when a timer expires. Shared so recurring timers can fire
/// more than once.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// TimerQueue
// ---------------------------------------------------------------------------

/// Heap key: deadline first, insertion sequence second. The sequence keeps
/// equal deadlines in insertion order and makes every key unique.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    next: u64,
    seq: u64,
}

struct TimerShared {
    seq: u64,
    state: Mutex<TimerState>,
}

struct TimerState {
    period_ms: u64,
    next: u64,
    recurring: bool,
    /// Cleared on cancellation and on one-shot expiry.
    cb: Option<TimerCallback>,
}

/// Deadline-ordered set of timers behind a shared/exclusive lock.
pub struct TimerQueue {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerShared>>>,
    /// Set when the wake hook has run and no poll has consumed it yet;
    /// suppresses duplicate wakes between polls.
    tickled: AtomicBool,
    next_seq: AtomicU64,
    wake: OnceLock<Box<dyn Fn() + Send + Sync>>,
    weak_self: Weak<TimerQueue>,
}

impl TimerQueue {
    pub fn new() -> Arc<TimerQueue> {
        Arc::new_cyclic(|weak| TimerQueue {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            wake: OnceLock::new(),
            weak_self: weak.clone(),
        })
    }

    /// Install the head-changed hook. Only the first installation wins.
    pub fn set_wake_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.wake.set(hook);
    }

    /// Add a timer firing `ms` milliseconds from now.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_callback(ms, Arc::new(cb), recurring)
    }

    /// Add a timer whose callback only runs while `witness` can still be
    /// upgraded. A witness dropped concurrently with expiry means the
    /// callback does not run.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        let guarded = move || {
            if witness.upgrade().is_some() {
                cb();
            }
        };
        self.add_callback(ms, Arc::new(guarded), recurring)
    }

    fn add_callback(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let next = now_ms() + ms;
        let shared = Arc::new(TimerShared {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                period_ms: ms,
                next,
                recurring,
                cb: Some(cb),
            }),
        });
        let key = TimerKey {
            next,
            seq: shared.seq,
        };
        let mut timers = self.timers.write();
        timers.insert(key, Arc::clone(&shared));
        self.notify_if_head(&timers, key);
        drop(timers);
        Timer {
            shared,
            queue: self.weak_self.clone(),
        }
    }

    /// Milliseconds until the earliest deadline, clamped at 0; `None` when
    /// the set is empty. Consumes any pending head-changed notification.
    pub fn next_delay(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::SeqCst);
        let timers = self.timers.read();
        let (key, _) = timers.iter().next()?;
        Some(key.next.saturating_sub(now_ms()))
    }

    /// Move every expired callback into `cbs`. Recurring timers are
    /// re-stamped `now + period` and stay in the set.
    pub fn collect_expired(&self, cbs: &mut Vec<TimerCallback>) {
        if self.timers.read().is_empty() {
            return;
        }
        let now = now_ms();
        let mut timers = self.timers.write();
        loop {
            let due = matches!(timers.first_key_value(), Some((key, _)) if key.next <= now);
            if !due {
                break;
            }
            let (_, shared) = timers.pop_first().expect("non-empty after head check");
            let mut state = shared.state.lock();
            let Some(cb) = state.cb.clone() else { continue };
            cbs.push(cb);
            if state.recurring {
                state.next = now + state.period_ms;
                let key = TimerKey {
                    next: state.next,
                    seq: shared.seq,
                };
                drop(state);
                timers.insert(key, shared);
            } else {
                state.cb = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().is_empty()
    }

    /// Caller holds the write lock. Runs the wake hook when `key` became the
    /// new head and no notification is already pending.
    fn notify_if_head(&self, timers: &BTreeMap<TimerKey, Arc<TimerShared>>, key: TimerKey) {
        let at_head = timers
            .first_key_value()
            .map(|(head, _)| *head == key)
            .unwrap_or(false);
        if at_head && !self.tickled.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.wake.get() {
                hook();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Handle to a scheduled timer.
pub struct Timer {
    shared: Arc<TimerShared>,
    queue: Weak<TimerQueue>,
}

impl Timer {
    /// Cancel the timer: clear its callback and remove it from the set.
    /// Idempotent; returns whether this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut timers = queue.timers.write();
        let mut state = self.shared.state.lock();
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        let key = TimerKey {
            next: state.next,
            seq: self.shared.seq,
        };
        drop(state);
        timers.remove(&key);
        true
    }

    /// Push the deadline out to `now + period`. Returns false on a cancelled
    /// or expired timer.
    pub fn refresh(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut timers = queue.timers.write();
        let mut state = self.shared.state.lock();
        if state.cb.is_none() {
            return false;
        }
        let old_key = TimerKey {
            next: state.next,
            seq: self.shared.seq,
        };
        if timers.remove(&old_key).is_none() {
            return false;
        }
        state.next = now_ms() + state.period_ms;
        let key = TimerKey {
            next: state.next,
            seq: self.shared.seq,
        };
        drop(state);
        timers.insert(key, Arc::clone(&self.shared));
        true
    }

    /// Change the period; with `from_now` the deadline is re-stamped as well.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut timers = queue.timers.write();
        let mut state = self.shared.state.lock();
        if state.cb.is_none() {
            return false;
        }
        if ms == state.period_ms && !from_now {
            return false;
        }
        let old_key = TimerKey {
            next: state.next,
            seq: self.shared.seq,
        };
        if timers.remove(&old_key).is_none() {
            return false;
        }
        state.period_ms = ms;
        if from_now {
            state.next = now_ms() + ms;
        }
        let key = TimerKey {
            next: state.next,
            seq: self.shared.seq,
        };
        drop(state);
        timers.insert(key, Arc::clone(&self.shared));
        queue.notify_if_head(&timers, key);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn drain(queue: &TimerQueue) -> usize {
        let mut cbs = Vec::new();
        queue.collect_expired(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_fires_after_deadline() {
        let queue = TimerQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _timer = queue.add_timer(10, {
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }, false);

        assert_eq!(drain(&queue), 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(drain(&queue), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!queue.has_timer());
    }

    #[test]
    fn test_next_delay_clamps_to_zero() {
        let queue = TimerQueue::new();
        let _timer = queue.add_timer(1, || {}, false);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.next_delay(), Some(0));

        let empty = TimerQueue::new();
        assert_eq!(empty.next_delay(), None);
    }

    #[test]
    fn test_expiry_order_is_by_deadline() {
        let queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, ms) in [(1u32, 30u64), (2, 5), (3, 15)] {
            let order = Arc::clone(&order);
            let _ = queue.add_timer(ms, move || order.lock().push(tag), false);
        }
        thread::sleep(Duration::from_millis(50));
        drain(&queue);
        assert_eq!(*order.lock(), vec![2, 3, 1]);
    }

    #[test]
    fn test_cancel_is_idempotent_and_final() {
        let queue = TimerQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = queue.add_timer(5, {
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }, false);

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!queue.has_timer());

        thread::sleep(Duration::from_millis(15));
        assert_eq!(drain(&queue), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!timer.refresh());
        assert!(!timer.reset(100, true));
    }

    #[test]
    fn test_refresh_preserves_recurrence() {
        let queue = TimerQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = queue.add_timer(20, {
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }, true);

        thread::sleep(Duration::from_millis(12));
        assert!(timer.refresh());
        assert_eq!(drain(&queue), 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(drain(&queue), 1);
        // Still recurring after refresh and expiry.
        assert!(queue.has_timer());
    }

    #[test]
    fn test_recurring_restamps_from_now() {
        let queue = TimerQueue::new();
        let timer = queue.add_timer(20, || {}, true);
        thread::sleep(Duration::from_millis(25));
        assert_eq!(drain(&queue), 1);
        // Re-stamped to now + period: an immediate second poll finds nothing.
        assert_eq!(drain(&queue), 0);
        assert!(queue.next_delay().unwrap() > 0);
        timer.cancel();
    }

    #[test]
    fn test_reset_changes_period() {
        let queue = TimerQueue::new();
        let timer = queue.add_timer(500, || {}, false);
        assert!(timer.reset(10, true));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(drain(&queue), 1);
    }

    #[test]
    fn test_condition_timer_skips_dropped_witness() {
        let queue = TimerQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let live = Arc::new(());
        let dead = Arc::new(());
        let dead_witness = Arc::downgrade(&dead);
        drop(dead);

        let _kept = queue.add_condition_timer(5, {
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        }, Arc::downgrade(&live), false);
        let _skipped = queue.add_condition_timer(5, {
            let hits = Arc::clone(&hits);
            move || {
                hits.fetch_add(100, Ordering::SeqCst);
            }
        }, dead_witness, false);

        thread::sleep(Duration::from_millis(15));
        drain(&queue);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wake_hook_on_new_head() {
        let queue = TimerQueue::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        queue.set_wake_hook(Box::new({
            let wakes = Arc::clone(&wakes);
            move || {
                wakes.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let _far = queue.add_timer(10_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // Notification still pending: a nearer head does not wake again.
        let _near = queue.add_timer(5_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // A poll consumes the notification; the next new head wakes.
        let _ = queue.next_delay();
        let _nearer = queue.add_timer(1_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);

        // Not a new head: no wake.
        let _late = queue.add_timer(8_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }
}
