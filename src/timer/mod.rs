//! Deadline-ordered callbacks.
//!
//! A [`TimerManager`] keeps its timers in a `BTreeMap` keyed by
//! `(next expiry, id)`, so the earliest deadline is always the first entry
//! and timers sharing a deadline fire in creation order. Whoever owns the
//! manager polls it with [`TimerManager::next_timer`] and
//! [`TimerManager::list_expired_callbacks`]; the manager never runs
//! callbacks itself.
//!
//! Deadlines are wall-clock milliseconds. If the clock jumps back by more
//! than an hour, every pending timer is treated as expired.

use crate::sys::current_ms;

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback stored in a timer. Recurring timers call it many times.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Backward clock jump beyond which every timer is considered expired.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type Key = (u64, u64);

struct Timers {
    set: BTreeMap<Key, Arc<Timer>>,
    /// Clock reading of the previous expiry pass.
    previous_ms: u64,
}

struct Shared {
    timers: RwLock<Timers>,

    /// Set once the front hook fired, cleared by `next_timer`.
    tickled: AtomicBool,

    on_front: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Shared {
    /// Inserts `timer` under `key`.
    ///
    /// Returns `true` if the front hook must run: the timer became the
    /// earliest one and nobody was told since the last `next_timer`.
    fn insert(&self, timers: &mut Timers, key: Key, timer: Arc<Timer>) -> bool {
        timers.set.insert(key, timer);

        let at_front = timers.set.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(hook) = &self.on_front {
            hook();
        }
    }
}

/// An ordered set of timers.
///
/// Cloning is cheap and yields a handle to the same set.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A manager calling `hook` whenever a new timer becomes the earliest
    /// one, at most once between two [`next_timer`](Self::next_timer)
    /// calls.
    pub fn with_front_hook<F>(hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(hook)))
    }

    fn build(on_front: Option<Box<dyn Fn() + Send + Sync>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                timers: RwLock::new(Timers {
                    set: BTreeMap::new(),
                    previous_ms: current_ms(),
                }),
                tickled: AtomicBool::new(false),
                on_front,
            }),
        }
    }

    /// Arms a timer firing `ms` milliseconds from now, and every `ms`
    /// milliseconds after that when `recurring`.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let next = current_ms() + ms;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(TimerInner {
                period: ms,
                next,
                recurring,
                callback: Some(Arc::new(callback)),
            }),
            manager: Arc::downgrade(&self.shared),
        });

        let key = (next, timer.id);
        let at_front = {
            let mut timers = self.shared.timers.write();
            self.shared.insert(&mut timers, key, timer.clone())
        };

        if at_front {
            self.shared.notify_front();
        }

        timer
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs while
    /// `condition` can still be upgraded.
    pub fn add_condition_timer<T, F>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest timer expires, `Some(0)` if it is
    /// already due, `None` without timers.
    pub fn next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);

        let timers = self.shared.timers.read();
        let (&(next, _), _) = timers.set.first_key_value()?;

        Some(next.saturating_sub(current_ms()))
    }

    /// Detaches every expired timer and appends its callback to `out`.
    ///
    /// Recurring timers are re-armed one period after now; the others are
    /// spent.
    pub fn list_expired_callbacks(&self, out: &mut Vec<TimerCallback>) {
        self.list_expired_callbacks_at(current_ms(), out);
    }

    pub(crate) fn list_expired_callbacks_at(&self, now: u64, out: &mut Vec<TimerCallback>) {
        if self.shared.timers.read().set.is_empty() {
            return;
        }

        let mut timers = self.shared.timers.write();

        let rollover = now < timers.previous_ms.saturating_sub(ROLLOVER_MS);
        timers.previous_ms = now;

        let Some(&(first, _)) = timers.set.keys().next() else {
            return;
        };
        if !rollover && first > now {
            return;
        }

        let expired = if rollover {
            mem::take(&mut timers.set)
        } else {
            let later = timers.set.split_off(&(now + 1, 0));
            mem::replace(&mut timers.set, later)
        };

        out.reserve(expired.len());

        for (_, timer) in expired {
            let mut inner = timer.inner.lock();
            let Some(callback) = inner.callback.clone() else {
                continue;
            };

            out.push(callback);

            if inner.recurring {
                inner.next = now + inner.period;
                let key = (inner.next, timer.id);
                drop(inner);

                timers.set.insert(key, timer);
            } else {
                inner.callback = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().set.is_empty()
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.shared.timers.read().set.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.len())
            .finish()
    }
}

struct TimerInner {
    period: u64,
    next: u64,
    recurring: bool,
    /// `None` once cancelled or spent.
    callback: Option<TimerCallback>,
}

/// Handle to an armed timer.
///
/// Lock order is always the manager's set first, then the timer.
pub struct Timer {
    id: u64,
    inner: Mutex<TimerInner>,
    manager: Weak<Shared>,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Interval in milliseconds.
    pub fn period(&self) -> u64 {
        self.inner.lock().period
    }

    pub fn is_recurring(&self) -> bool {
        self.inner.lock().recurring
    }

    /// `true` until the timer is cancelled or, for a one-shot timer, fired.
    pub fn is_armed(&self) -> bool {
        self.inner.lock().callback.is_some()
    }

    /// Disarms the timer. Returns `false` if it was already gone.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = shared.timers.write();
        let mut inner = self.inner.lock();

        if inner.callback.take().is_none() {
            return false;
        }

        timers.set.remove(&(inner.next, self.id));
        true
    }

    /// Pushes the deadline to one full period from now.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = shared.timers.write();
        let mut inner = self.inner.lock();

        if inner.callback.is_none() {
            return false;
        }

        let Some(timer) = timers.set.remove(&(inner.next, self.id)) else {
            return false;
        };

        inner.next = current_ms() + inner.period;
        timers.set.insert((inner.next, self.id), timer);

        true
    }

    /// Changes the period to `ms`.
    ///
    /// The new deadline counts from now when `from_now` is set, otherwise
    /// from the start of the current period.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let at_front = {
            let mut timers = shared.timers.write();
            let mut inner = self.inner.lock();

            if inner.callback.is_none() {
                return false;
            }

            if ms == inner.period && !from_now {
                return true;
            }

            let Some(timer) = timers.set.remove(&(inner.next, self.id)) else {
                return false;
            };

            let start = if from_now {
                current_ms()
            } else {
                inner.next - inner.period
            };

            inner.period = ms;
            inner.next = start + ms;
            let key = (inner.next, self.id);
            drop(inner);

            shared.insert(&mut timers, key, timer)
        };

        if at_front {
            shared.notify_front();
        }

        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("period", &inner.period)
            .field("next", &inner.next)
            .field("recurring", &inner.recurring)
            .field("armed", &inner.callback.is_some())
            .finish()
    }
}
