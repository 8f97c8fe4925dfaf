//! Deadline-ordered timers.
//!
//! Timers are kept in a set ordered by `(absolute deadline ms, sequence)`;
//! the sequence number breaks deadline ties deterministically, so
//! cancellation and re-insertion are unambiguous. Firing is pull-based: the
//! owner periodically asks for [`TimerQueue::next_timeout`] and collects due
//! callbacks with [`TimerQueue::take_expired`].
//!
//! A *condition* timer additionally carries a weak witness; if the witness
//! is gone by the time the timer comes due, the fire is silently dropped
//! (recurring timers are still re-armed).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::warn;

use crate::clock;

/// How far the monotonic clock must appear to travel backwards before we
/// assume a rollover and flush every timer.
const BACKWARDS_JUMP_MS: u64 = 60 * 60 * 1000;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    seq: u64,
    recurring: bool,
    /// Delay at arm time; doubles as the period for recurring timers.
    /// Mutated only under the queue lock.
    interval_ms: AtomicU64,
    deadline_ms: AtomicU64,
    callback: TimerCallback,
    condition: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

impl TimerEntry {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::SeqCst), self.seq)
    }
}

/// Handle to an armed timer; used to cancel or re-arm it. Cloneable, stays
/// valid (but inert) after the timer fired or was cancelled.
#[derive(Clone)]
pub struct TimerHandle(Arc<TimerEntry>);

pub struct TimerQueue {
    inner: Mutex<Inner>,
    next_seq: AtomicU64,
}

struct Inner {
    timers: BTreeMap<(u64, u64), Arc<TimerEntry>>,
    last_now_ms: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            inner: Mutex::new(Inner {
                timers: BTreeMap::new(),
                last_now_ms: clock::now_ms(),
            }),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Arm a timer firing `delay` from now. Returns the handle and whether
    /// the new timer became the earliest one (the owner then has to refresh
    /// any in-progress wait).
    pub fn add(
        &self,
        delay: Duration,
        callback: TimerCallback,
        recurring: bool,
    ) -> (TimerHandle, bool) {
        self.insert(delay, callback, None, recurring)
    }

    /// Like [`TimerQueue::add`], but the fire only happens while `witness`
    /// is still upgradable.
    pub fn add_condition<T: Send + Sync + 'static>(
        &self,
        delay: Duration,
        callback: TimerCallback,
        witness: Weak<T>,
        recurring: bool,
    ) -> (TimerHandle, bool) {
        let condition: Box<dyn Fn() -> bool + Send + Sync> =
            Box::new(move || witness.upgrade().is_some());
        self.insert(delay, callback, Some(condition), recurring)
    }

    fn insert(
        &self,
        delay: Duration,
        callback: TimerCallback,
        condition: Option<Box<dyn Fn() -> bool + Send + Sync>>,
        recurring: bool,
    ) -> (TimerHandle, bool) {
        let interval = delay.as_millis() as u64;
        let deadline = clock::now_ms() + interval;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(TimerEntry {
            seq,
            recurring,
            interval_ms: AtomicU64::new(interval),
            deadline_ms: AtomicU64::new(deadline),
            callback,
            condition,
        });
        let mut inner = self.inner.lock().unwrap();
        inner.timers.insert((deadline, seq), entry.clone());
        let at_front = inner.timers.keys().next() == Some(&(deadline, seq));
        (TimerHandle(entry), at_front)
    }

    /// Disarm `handle`. Idempotent; returns whether the timer was armed.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.timers.remove(&handle.0.key()).is_some()
    }

    /// Re-arm `handle` with a new delay, measured from now or from the
    /// timer's previous arm point. Returns false if the timer is no longer
    /// armed.
    pub fn reset(&self, handle: &TimerHandle, delay: Duration, from_now: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let entry = match inner.timers.remove(&handle.0.key()) {
            Some(e) => e,
            None => return false,
        };
        let new_interval = delay.as_millis() as u64;
        let start = if from_now {
            clock::now_ms()
        } else {
            entry.deadline_ms.load(Ordering::SeqCst) - entry.interval_ms.load(Ordering::SeqCst)
        };
        let deadline = start + new_interval;
        entry.interval_ms.store(new_interval, Ordering::SeqCst);
        entry.deadline_ms.store(deadline, Ordering::SeqCst);
        inner.timers.insert((deadline, entry.seq), entry);
        true
    }

    /// Milliseconds until the next fire; `None` when nothing is armed.
    pub fn next_timeout(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .timers
            .keys()
            .next()
            .map(|&(deadline, _)| deadline.saturating_sub(clock::now_ms()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    /// Pop every timer due at `now_ms` and return the callbacks to run, in
    /// `(deadline, sequence)` order. Recurring timers are re-armed here with
    /// `deadline += period`. A backwards clock jump beyond an hour flushes
    /// the whole queue.
    pub fn take_expired(&self, now_ms: u64) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock().unwrap();
        let rollover = now_ms < inner.last_now_ms.saturating_sub(BACKWARDS_JUMP_MS);
        if rollover {
            warn!("monotonic clock jumped backwards, expiring all timers");
        }
        inner.last_now_ms = now_ms;
        if inner.timers.is_empty() {
            return Vec::new();
        }

        let mut fired = Vec::new();
        let mut rearm = Vec::new();
        loop {
            let key = match inner.timers.keys().next() {
                Some(&k) => k,
                None => break,
            };
            if !rollover && key.0 > now_ms {
                break;
            }
            let entry = inner.timers.remove(&key).unwrap();
            let witnessed = entry.condition.as_ref().map_or(true, |alive| alive());
            if witnessed {
                fired.push(entry.callback.clone());
            }
            if entry.recurring {
                let next = key.0 + entry.interval_ms.load(Ordering::SeqCst);
                entry.deadline_ms.store(next, Ordering::SeqCst);
                rearm.push(((next, entry.seq), entry));
            }
        }
        for (key, entry) in rearm {
            inner.timers.insert(key, entry);
        }
        fired
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
