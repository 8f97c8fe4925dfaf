//! Stackful cooperative fibers.
//!
//! With the fiber module, you can:
//! - create fibers with their own stack and resume them explicitly,
//! - yield from inside a fiber back to the context that resumed it,
//! - hand fibers to a [`Scheduler`](crate::scheduler::Scheduler) and let a
//!   worker pool multiplex them.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it runs until it yields or its closure returns. Within one OS thread only
//! one fiber executes at a time; the thread itself is represented by an
//! implicit *thread-root* fiber that owns the native stack and is
//! materialized lazily on first use.
//!
//! Every fiber swap is anchored: [`Fiber::swap_in`]/[`Fiber::swap_out`] pair
//! with the thread's *scheduling fiber* (where a dispatch loop lives, see
//! [`scheduling_fiber`](crate::scheduler::scheduling_fiber)), while
//! [`Fiber::resume`]/[`Fiber::back`] pair with the thread-root fiber. On a
//! thread that runs no scheduler both anchors are the thread-root fiber.

use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error};

use crate::config::Config;

mod context;
use context::{Context, Stack};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never resumed since.
    Init = 0,
    /// Suspended and asking to be rescheduled.
    Ready = 1,
    /// Currently executing on some thread.
    Exec = 2,
    /// Suspended until somebody resumes it explicitly.
    Hold = 3,
    /// Closure returned; the fiber will never run again.
    Term = 4,
    /// Closure panicked; the fiber will never run again.
    Except = 5,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }

    /// Term or Except: the fiber must never be resumed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// An independently schedulable unit of execution with a dedicated stack.
///
/// Fibers are shared through `Arc`: the creator, the scheduler queue and any
/// event slot waiting to wake the fiber each hold a handle. Whoever resumes
/// a fiber must keep a handle alive until the swap returns.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Terminal yield target: scheduling fiber, or the thread-root fiber
    /// when the fiber hosts a dispatch loop in the constructing thread.
    back_to_thread: bool,
    /// False from just before a yield makes the fiber queue-visible (the
    /// state flip away from `Exec`) until the resuming side has seen the
    /// register save complete. A fiber that is suspended-looking but not
    /// yet stealable must not be switched into.
    stealable: AtomicBool,
    ctx: UnsafeCell<Context>,
    /// `None` only for the thread-root fiber, which runs on the native stack.
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    me: Weak<Fiber>,
}

// Safety: `ctx` and `entry` are only touched by the thread currently running
// or resuming the fiber. A fiber migrates between threads only while
// suspended, and the scheduler queue (a mutex) provides the happens-before
// edge for the migration.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `f` with the configured default stack size.
    ///
    /// The new fiber is in [`FiberState::Init`] and does not run until
    /// resumed or scheduled.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::make(Box::new(f), 0, false)
    }

    /// Like [`Fiber::new`] with an explicit stack size in bytes.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::make(Box::new(f), stack_size, false)
    }

    /// Full-control constructor. `stack_size == 0` selects the configured
    /// default. With `use_caller` set, the fiber's terminal yield returns to
    /// the thread-root fiber instead of the scheduling fiber; this is the
    /// variant a scheduler uses for the dispatch fiber it plants in its
    /// constructing thread.
    pub fn new_with<F>(f: F, stack_size: usize, use_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::make(Box::new(f), stack_size, use_caller)
    }

    pub(crate) fn new_boxed(f: Box<dyn FnOnce() + Send>) -> Arc<Fiber> {
        Self::make(f, 0, false)
    }

    fn make(f: Box<dyn FnOnce() + Send>, stack_size: usize, use_caller: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            Config::get().fiber.stack_size as usize
        } else {
            stack_size
        };
        let stack = Stack::alloc(stack_size);
        let ctx = unsafe { Context::prepare(stack.top(), fiber_entry) };
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::SeqCst);
        FIBER_COUNT.fetch_add(1, Ordering::SeqCst);
        debug!("fiber {} created, stack_size={}", id, stack.size());
        Arc::new_cyclic(|me| Fiber {
            id,
            state: AtomicU8::new(FiberState::Init as u8),
            back_to_thread: use_caller,
            stealable: AtomicBool::new(true),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(f)),
            me: me.clone(),
        })
    }

    /// The thread-root fiber: no owned stack, permanently `Exec`, no closure.
    fn new_root() -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::SeqCst);
        FIBER_COUNT.fetch_add(1, Ordering::SeqCst);
        debug!("thread-root fiber {} created", id);
        Arc::new_cyclic(|me| Fiber {
            id,
            state: AtomicU8::new(FiberState::Exec as u8),
            back_to_thread: false,
            stealable: AtomicBool::new(true),
            ctx: UnsafeCell::new(Context::empty()),
            stack: None,
            entry: UnsafeCell::new(None),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Rewind a finished (or never started) fiber onto a fresh closure,
    /// reusing its stack. The fiber is back in [`FiberState::Init`].
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, f: Box<dyn FnOnce() + Send>) {
        assert!(self.stack.is_some(), "cannot reset a thread-root fiber");
        let state = self.state();
        assert!(
            matches!(state, FiberState::Term | FiberState::Except | FiberState::Init),
            "fiber {} reset in state {:?}",
            self.id,
            state
        );
        let stack = self.stack.as_ref().unwrap();
        unsafe {
            *self.entry.get() = Some(f);
            *self.ctx.get() = Context::prepare(stack.top(), fiber_entry);
        }
        self.set_state(FiberState::Init);
    }

    /// Resume this fiber from the current thread's scheduling fiber. Returns
    /// when the fiber yields or terminates.
    pub fn swap_in(&self) {
        let anchor = crate::scheduler::scheduling_fiber();
        self.activate(&anchor);
    }

    /// Suspend the fiber, returning control to the scheduling fiber. The
    /// caller sets the state (`Ready` or `Hold`) before swapping.
    pub fn swap_out(&self) {
        let anchor = crate::scheduler::scheduling_fiber();
        self.deactivate(&anchor);
    }

    /// Like [`Fiber::swap_in`], anchored to the thread-root fiber. This is
    /// how a fiber is driven on a thread that hosts no dispatch loop, and
    /// how a scheduler drives its caller-thread dispatch fiber.
    pub fn resume(&self) {
        let anchor = thread_fiber();
        self.activate(&anchor);
    }

    /// Inverse of [`Fiber::resume`].
    pub fn back(&self) {
        let anchor = thread_fiber();
        self.deactivate(&anchor);
    }

    fn shared(&self) -> Arc<Fiber> {
        self.me.upgrade().expect("fiber resumed with no live handle")
    }

    fn activate(&self, anchor: &Arc<Fiber>) {
        let state = self.state();
        assert!(state != FiberState::Exec, "fiber {} is already executing", self.id);
        assert!(
            !state.is_terminal(),
            "fiber {} resumed after termination (state {:?})",
            self.id,
            state
        );
        debug_assert!(
            !std::ptr::eq(self, Arc::as_ptr(anchor)),
            "fiber {} cannot swap into itself",
            self.id
        );
        set_current(self.shared());
        self.set_state(FiberState::Exec);
        unsafe { context::switch(anchor.ctx.get(), self.ctx.get()) };
        // The switch came back, so whatever this fiber's last yield saved
        // is complete; only now may another worker pick it up.
        self.stealable.store(true, Ordering::Release);
    }

    fn deactivate(&self, anchor: &Arc<Fiber>) {
        // Backstop for callers of raw swap_out that flipped the state
        // themselves; the yield helpers already cleared the flag before
        // their state store.
        self.stealable.store(false, Ordering::Release);
        set_current(anchor.clone());
        unsafe { context::switch(self.ctx.get(), anchor.ctx.get()) };
    }

    /// Whether the fiber's saved context is complete and may be resumed by
    /// another worker.
    pub(crate) fn is_stealable(&self) -> bool {
        self.stealable.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::SeqCst);
        let state = self.state();
        if self.stack.is_some() {
            assert!(
                matches!(state, FiberState::Term | FiberState::Init | FiberState::Except),
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        } else {
            debug_assert_eq!(state, FiberState::Exec);
            debug_assert!(unsafe { (*self.entry.get()).is_none() });
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread-local handles and yields
////////////////////////////////////////////////////////////////////////////////

/// The fiber currently executing on this thread. On a thread that has not
/// run any fiber yet this materializes the thread-root fiber.
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    let root = Fiber::new_root();
    CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
    THREAD_FIBER.with(|t| *t.borrow_mut() = Some(root.clone()));
    root
}

/// Id of the current fiber, `0` when the thread has no fibers yet. Does not
/// allocate, so it is safe to call from the logger.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
}

/// Total number of live fibers in the process, thread-root fibers included.
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::SeqCst)
}

/// The fiber representing this thread's native stack.
pub(crate) fn thread_fiber() -> Arc<Fiber> {
    if let Some(f) = THREAD_FIBER.with(|t| t.borrow().clone()) {
        return f;
    }
    // First touch: the current fiber *is* the thread-root fiber.
    current()
}

fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(f));
}

/// Suspend the current fiber and ask to be rescheduled.
pub fn yield_to_ready() {
    let cur = current();
    assert_eq!(cur.state(), FiberState::Exec);
    // Unstealable before the state flip: the moment the state leaves Exec
    // the fiber is fair game for the dispatch scan, but its registers are
    // not saved until the switch below completes.
    cur.stealable.store(false, Ordering::Release);
    cur.set_state(FiberState::Ready);
    cur.swap_out();
}

/// Suspend the current fiber; somebody else is responsible for resuming it.
pub fn yield_to_hold() {
    let cur = current();
    assert_eq!(cur.state(), FiberState::Exec);
    // Same ordering as yield_to_ready: close the steal window first.
    cur.stealable.store(false, Ordering::Release);
    cur.set_state(FiberState::Hold);
    cur.swap_out();
}

////////////////////////////////////////////////////////////////////////////////
// Trampoline
////////////////////////////////////////////////////////////////////////////////

extern "C" fn fiber_entry() -> ! {
    let back_to_thread;
    {
        let cur = current();
        back_to_thread = cur.back_to_thread;
        let f = unsafe { (*cur.entry.get()).take() }.expect("fiber started without a closure");
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => cur.set_state(FiberState::Term),
            Err(payload) => {
                cur.set_state(FiberState::Except);
                error!(
                    "fiber {} panicked: {}\n{}",
                    cur.id,
                    payload_message(payload.as_ref()),
                    Backtrace::force_capture()
                );
            }
        }
        // `cur` drops here, on the fiber's own stack, before the last swap.
        // The context that resumed us still holds a handle.
    }
    final_swap(back_to_thread)
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// The terminal yield. Must not hold any `Arc<Fiber>` on this stack: values
/// left here are never dropped.
fn final_swap(back_to_thread: bool) -> ! {
    let cur: *const Fiber = CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .map(|f| Arc::as_ptr(f))
            .expect("terminal yield outside a fiber")
    });
    unsafe {
        if back_to_thread {
            (*cur).back();
        } else {
            (*cur).swap_out();
        }
    }
    unreachable!("fiber resumed after termination");
}
