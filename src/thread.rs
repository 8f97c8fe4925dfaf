//! Named worker threads.
//!
//! A thin wrapper over [`std::thread`] that records the kernel thread id,
//! publishes the thread name through a TLS slot (readable from the logger
//! without a syscall) and synchronizes with the parent before returning, so
//! a freshly spawned worker is fully identified by the time `spawn` gives
//! back the handle.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;

use crate::sync::Semaphore;

// The kernel limit for a thread name, not counting the nul byte.
const MAX_NAME_LEN: usize = 15;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("main"));
    static THREAD_TID: Cell<libc::pid_t> = Cell::new(0);
}

pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn a named OS thread running `f`.
    ///
    /// Blocks until the child has recorded its kernel tid and name; the
    /// returned handle is joinable. Dropping the handle without joining
    /// detaches the thread.
    ///
    /// Thread creation failure is a resource-exhaustion condition and is
    /// treated as fatal.
    pub fn spawn<F>(name: &str, f: F) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let name = if name.is_empty() { "unnamed" } else { name }.to_string();
        let ready = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI32::new(0));

        let child_name = name.clone();
        let child_ready = ready.clone();
        let child_tid = tid_slot.clone();
        let builder = std::thread::Builder::new().name(truncated(&name));
        let handle = builder
            .spawn(move || {
                THREAD_NAME.with(|n| *n.borrow_mut() = child_name.clone());
                child_tid.store(Self::current_tid(), Ordering::SeqCst);
                set_os_name(&child_name);
                child_ready.post();
                f();
            })
            .unwrap_or_else(|e| {
                error!("failed to spawn thread {}: {}", name, e);
                panic!("thread spawn failed");
            });

        ready.wait();
        Thread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::SeqCst),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread id of the spawned thread.
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// Wait for the thread to finish. A worker that panicked past its own
    /// guards is logged and otherwise ignored.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread {} terminated by panic", self.name);
            }
        }
    }

    /// Kernel thread id of the calling thread, cached per thread.
    pub fn current_tid() -> libc::pid_t {
        THREAD_TID.with(|t| {
            let mut tid = t.get();
            if tid == 0 {
                tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
                t.set(tid);
            }
            tid
        })
    }

    /// Name of the calling thread as recorded at spawn time.
    pub fn current_name() -> String {
        THREAD_NAME.with(|n| n.borrow().clone())
    }
}

// Dropping an unjoined handle detaches the thread, matching JoinHandle.

fn truncated(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

fn set_os_name(name: &str) {
    let mut buf = [0u8; MAX_NAME_LEN + 1];
    let bytes = truncated(name);
    buf[..bytes.len()].copy_from_slice(bytes.as_bytes());
    unsafe {
        libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong);
    }
}
