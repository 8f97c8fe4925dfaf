//! Thread-level synchronization primitives.
//!
//! These block the underlying OS thread and are **not** fiber suspension
//! points. The scheduler and reactor use plain [`std::sync::Mutex`] and
//! [`std::sync::RwLock`] for their shared state; this module only carries
//! the pieces std does not provide.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

/// A counting semaphore.
///
/// Used for the worker-thread startup handshake: the parent waits until the
/// child has published its identity before `spawn` returns.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block the calling thread until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit, waking a single waiter if any.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

////////////////////////////////////////////////////////////////////////////////
// SpinLock
////////////////////////////////////////////////////////////////////////////////

/// A test-and-set spinlock with an RAII guard.
///
/// Only for critical sections that are a handful of instructions long (the
/// logger uses it to keep output lines whole).
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this
/// structure is dropped (falls out of scope), the lock will be unlocked.
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl<'a> Drop for SpinLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_handshake() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let t = std::thread::spawn(move || sem2.post());
        sem.wait();
        t.join().unwrap();
    }

    #[test]
    fn spinlock_excludes() {
        let lock = SpinLock::new();
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
