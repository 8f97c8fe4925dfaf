//! Edge-triggered I/O readiness joined to the fiber scheduler.
//!
//! The [`IoManager`] owns an epoll instance, a self-pipe for waking sleeping
//! workers and a [`TimerQueue`]. Suspended fibers are the unit of wakeup:
//! arming an event stores the current fiber (or a closure) in the fd's slot,
//! and readiness, cancellation or a timer puts it back on its scheduler's
//! ready list.
//!
//! Worker threads sleep inside [`epoll_wait`](libc::epoll_wait) via the
//! scheduler's idle fiber; a one-byte write to the self-pipe ("tickle")
//! forces a sleeping worker out so it can pick up new work or recompute its
//! timer deadline.

use std::cell::RefCell;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use log::{debug, error};

use crate::clock;
use crate::fiber::{self, Fiber, FiberState};
use crate::scheduler::{Notifier, Scheduler, Task};
use crate::timer::{TimerCallback, TimerHandle, TimerQueue};
use crate::Result;

/// Longest single sleep inside `epoll_wait`; bounds how stale a worker's
/// view of the timer queue can get even if a tickle is lost.
const MAX_TIMEOUT_MS: u64 = 3000;
const MAX_EVENTS: usize = 256;

bitflags! {
    /// Readiness directions. The values intentionally match `EPOLLIN` and
    /// `EPOLLOUT` so translation to and from the kernel mask is a no-op.
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

thread_local! {
    static IO_MANAGER: RefCell<Option<Arc<IoManager>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Fd contexts
////////////////////////////////////////////////////////////////////////////////

enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

/// Per-direction slot: who to wake, and on whose scheduler.
struct EventCtx {
    scheduler: Option<Arc<Scheduler>>,
    waiter: Option<Waiter>,
}

impl EventCtx {
    fn new() -> EventCtx {
        EventCtx {
            scheduler: None,
            waiter: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.waiter.is_none()
    }
}

struct FdInner {
    armed: Event,
    read: EventCtx,
    write: EventCtx,
}

impl FdInner {
    fn ctx_mut(&mut self, event: Event) -> &mut EventCtx {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            unreachable!("event context lookup for {:?}", event)
        }
    }
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            inner: Mutex::new(FdInner {
                armed: Event::empty(),
                read: EventCtx::new(),
                write: EventCtx::new(),
            }),
        })
    }

    /// Move the stored waiter back onto its scheduler and clear the slot.
    /// The fd lock must be held.
    fn trigger(inner: &mut FdInner, event: Event) {
        assert!(inner.armed.contains(event));
        inner.armed.remove(event);
        let ctx = inner.ctx_mut(event);
        let sched = ctx.scheduler.take().expect("armed event without a scheduler");
        match ctx.waiter.take().expect("armed event without a waiter") {
            Waiter::Fiber(f) => sched.schedule(Task::fiber(f)),
            Waiter::Callback(cb) => sched.schedule(Task::callback_boxed(cb)),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoManager
////////////////////////////////////////////////////////////////////////////////

/// Scheduler plus reactor: readiness events and timers wake parked fibers.
///
/// Dereferences to its [`Scheduler`], so `schedule`/`spawn`/`switch_to` are
/// available directly on the manager.
pub struct IoManager {
    sched: Arc<Scheduler>,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    timers: TimerQueue,
}

struct IoNotifier {
    mgr: Weak<IoManager>,
    tickle_fd: RawFd,
}

impl Notifier for IoNotifier {
    fn tickle(&self, sched: &Scheduler) {
        if !sched.has_idle_workers() {
            return;
        }
        tickle_pipe(self.tickle_fd);
    }

    fn idle(&self, sched: &Arc<Scheduler>) {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.poll_once(sched);
        }
    }

    fn stopping(&self) -> bool {
        match self.mgr.upgrade() {
            Some(mgr) => {
                mgr.timers.next_timeout().is_none() && mgr.pending.load(Ordering::SeqCst) == 0
            }
            None => true,
        }
    }

    fn on_worker_start(&self) {
        if let Some(mgr) = self.mgr.upgrade() {
            IO_MANAGER.with(|m| *m.borrow_mut() = Some(mgr));
        }
    }
}

fn tickle_pipe(fd: RawFd) {
    let byte = [b'T'];
    let rc = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // A full pipe means the sleepers are already due to wake up.
        if err.kind() != io::ErrorKind::WouldBlock {
            error!("tickle write failed: {}", err);
        }
    }
}

impl IoManager {
    /// Create the reactor and start its scheduler.
    ///
    /// `threads` and `use_caller` are forwarded to [`Scheduler::new`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut pipe_fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(err.into());
        }

        let mgr = Arc::new_cyclic(|me: &Weak<IoManager>| {
            let notifier = Box::new(IoNotifier {
                mgr: me.clone(),
                tickle_fd: pipe_fds[1],
            });
            let sched = Scheduler::new_with_notifier(threads, use_caller, name, notifier);
            IoManager {
                sched,
                epfd,
                tickle_fds: pipe_fds,
                fd_contexts: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
                timers: TimerQueue::new(),
            }
        });
        mgr.grow_contexts(32);
        if use_caller {
            IO_MANAGER.with(|m| *m.borrow_mut() = Some(mgr.clone()));
        }
        mgr.sched.start();
        debug!("io manager {} started", mgr.sched.name());
        Ok(mgr)
    }

    /// The I/O manager whose worker the calling thread is, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        IO_MANAGER.with(|m| m.borrow().clone())
    }

    /// Stop the scheduler and release this thread's manager handle.
    pub fn stop(&self) {
        self.sched.stop();
        IO_MANAGER.with(|m| m.borrow_mut().take());
    }

    /// Number of currently armed `(fd, event)` pairs.
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of currently armed timers.
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    ////////////////////////////////////////////////////////////////////////
    // Event arming
    ////////////////////////////////////////////////////////////////////////

    /// Arm `event` on `fd` with the *current fiber* as the waiter. When the
    /// event fires (or is cancelled) the fiber goes back on its scheduler's
    /// ready list; the caller is expected to yield to hold right after.
    ///
    /// Arming an event that is already armed on the same fd is a contract
    /// violation and aborts.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Arm `event` on `fd` with a callback waiter.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let cb: Box<dyn FnOnce() + Send> = Box::new(cb);
        self.add_event_inner(fd, event, Some(cb))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one event direction must be armed at a time"
        );
        let fd_ctx = self.fd_context_or_grow(fd);
        let mut inner = fd_ctx.inner.lock().unwrap();
        assert!(
            !inner.armed.contains(event),
            "event {:?} already armed for fd {}",
            event,
            fd
        );

        let op = if inner.armed.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | (inner.armed | event).bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            let ev_events = ev.events;
            error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd, op, fd, ev_events, err
            );
            return Err(err.into());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.armed |= event;
        let ctx = inner.ctx_mut(event);
        assert!(ctx.is_empty());
        ctx.scheduler = Some(Scheduler::current().unwrap_or_else(|| self.sched.clone()));
        ctx.waiter = Some(match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let f = fiber::current();
                assert_eq!(
                    f.state(),
                    FiberState::Exec,
                    "only the executing fiber can wait for an event"
                );
                Waiter::Fiber(f)
            }
        });
        Ok(())
    }

    /// Disarm `event` on `fd` without waking the waiter. Returns whether the
    /// event was armed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let fd_ctx = match self.fd_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.armed.contains(event) {
            return false;
        }
        let residual = inner.armed - event;
        if !self.epoll_rearm(fd, residual) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.armed = residual;
        let ctx = inner.ctx_mut(event);
        ctx.scheduler = None;
        ctx.waiter = None;
        true
    }

    /// Disarm `event` on `fd` and wake the waiter as if the event had fired.
    /// The awakened side observes no readiness and must consult its own
    /// timeout or errno state.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let fd_ctx = match self.fd_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.armed.contains(event) {
            return false;
        }
        let residual = inner.armed - event;
        if !self.epoll_rearm(fd, residual) {
            return false;
        }
        FdContext::trigger(&mut inner, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel both directions on `fd`, waking every waiter.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let fd_ctx = match self.fd_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if inner.armed.is_empty() {
            return false;
        }
        let mut ev = libc::epoll_event { events: 0, u64: fd as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            error!("epoll_ctl({}, DEL, {}) failed: {}", self.epfd, fd, err);
            return false;
        }
        if inner.armed.contains(Event::READ) {
            FdContext::trigger(&mut inner, Event::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.armed.contains(Event::WRITE) {
            FdContext::trigger(&mut inner, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(inner.armed.is_empty());
        true
    }

    fn epoll_rearm(&self, fd: RawFd, residual: Event) -> bool {
        let op = if residual.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | residual.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            let ev_events = ev.events;
            error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd, op, fd, ev_events, err
            );
            return false;
        }
        true
    }

    ////////////////////////////////////////////////////////////////////////
    // Timers
    ////////////////////////////////////////////////////////////////////////

    /// Arm a timer; the callback runs as a scheduler task when it fires.
    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, at_front) = self.timers.add(delay, Arc::new(cb), recurring);
        if at_front {
            // A sleeping worker may be waiting on a longer deadline.
            self.tickle_for_timer();
        }
        handle
    }

    /// Arm a timer gated on `witness`: if the witness is gone at fire time
    /// the callback is silently dropped.
    pub fn add_condition_timer<F, T>(
        &self,
        delay: Duration,
        cb: F,
        witness: Weak<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let (handle, at_front) = self
            .timers
            .add_condition(delay, Arc::new(cb), witness, recurring);
        if at_front {
            self.tickle_for_timer();
        }
        handle
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) -> bool {
        self.timers.cancel(handle)
    }

    pub fn reset_timer(&self, handle: &TimerHandle, delay: Duration, from_now: bool) -> bool {
        let found = self.timers.reset(handle, delay, from_now);
        if found {
            self.tickle_for_timer();
        }
        found
    }

    fn tickle_for_timer(&self) {
        if self.sched.has_idle_workers() {
            tickle_pipe(self.tickle_fds[1]);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Idle round
    ////////////////////////////////////////////////////////////////////////

    /// One round of the idle fiber: sleep in epoll until readiness, a
    /// tickle or the next timer deadline, then dispatch whatever came due.
    fn poll_once(&self, sched: &Arc<Scheduler>) {
        let timeout = self
            .timers
            .next_timeout()
            .map_or(MAX_TIMEOUT_MS, |t| t.min(MAX_TIMEOUT_MS));

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let count = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout as libc::c_int,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!("epoll_wait failed: {}", err);
            break 0;
        };

        let expired = self.timers.take_expired(clock::now_ms());
        if !expired.is_empty() {
            debug!("{} timers expired", expired.len());
            sched.schedule_batch(
                expired
                    .into_iter()
                    .map(|cb: TimerCallback| Task::callback(move || (cb.as_ref())())),
            );
        }

        for ev in &events[..count] {
            if ev.u64 == self.tickle_fds[0] as u64 {
                let mut buf = [0u8; 256];
                while unsafe {
                    libc::read(
                        self.tickle_fds[0],
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                } > 0
                {}
                continue;
            }

            let fd = ev.u64 as RawFd;
            let fd_ctx = match self.fd_context(fd) {
                Some(c) => c,
                None => continue,
            };
            let mut inner = fd_ctx.inner.lock().unwrap();

            let mut bits = ev.events;
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // Deliver errors to whichever direction is waiting.
                bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            }
            let mut real = Event::empty();
            if bits & libc::EPOLLIN as u32 != 0 {
                real |= Event::READ;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                real |= Event::WRITE;
            }
            real &= inner.armed;
            if real.is_empty() {
                // Cancelled between the wakeup and this lock.
                continue;
            }

            let residual = inner.armed - real;
            if !self.epoll_rearm(fd_ctx.fd, residual) {
                continue;
            }
            if real.contains(Event::READ) {
                FdContext::trigger(&mut inner, Event::READ);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
            if real.contains(Event::WRITE) {
                FdContext::trigger(&mut inner, Event::WRITE);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Fd context array
    ////////////////////////////////////////////////////////////////////////

    fn fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.fd_contexts.read().unwrap();
        contexts.get(fd as usize).cloned()
    }

    fn fd_context_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "invalid fd {}", fd);
        if let Some(ctx) = self.fd_context(fd) {
            return ctx;
        }
        self.grow_contexts((fd as usize + 1).max(fd as usize * 3 / 2));
        self.fd_context(fd).unwrap()
    }

    /// The array only ever grows; contexts stay put so in-flight kernel
    /// events keep referring to live entries.
    fn grow_contexts(&self, size: usize) {
        let mut contexts = self.fd_contexts.write().unwrap();
        while contexts.len() < size {
            let next = contexts.len() as RawFd;
            contexts.push(FdContext::new(next));
        }
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
