//! M:N fiber scheduler.
//!
//! A [`Scheduler`] multiplexes any number of fibers over a fixed pool of
//! worker threads. Work arrives as [`Task`]s — a fiber or a plain closure,
//! optionally pinned to one worker — and is drained by a per-worker dispatch
//! loop. When a worker finds nothing to run it swaps into its *idle fiber*,
//! whose behavior is supplied by the owning runtime: the bare scheduler
//! simply spins through the queue, the I/O manager blocks in `epoll_wait`.
//!
//! With `use_caller` the constructing thread itself becomes worker `0`: the
//! dispatch loop for it lives in a dedicated fiber that [`Scheduler::stop`]
//! drives to completion on the caller's stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};

use crate::fiber::{self, Fiber, FiberState};
use crate::thread::Thread;

thread_local! {
    static SCHEDULER: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

/// One schedulable item: a fiber to resume or a closure to run in a fresh
/// (or recycled) fiber, with an optional worker affinity.
pub struct Task {
    kind: TaskKind,
    affinity: Option<usize>,
}

enum TaskKind {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Task {
    pub fn fiber(f: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            affinity: None,
        }
    }

    pub fn callback<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Callback(Box::new(f)),
            affinity: None,
        }
    }

    pub(crate) fn callback_boxed(f: Box<dyn FnOnce() + Send>) -> Task {
        Task {
            kind: TaskKind::Callback(f),
            affinity: None,
        }
    }

    /// Restrict the task to one worker (see [`worker_id`]).
    pub fn pinned(mut self, worker: usize) -> Task {
        self.affinity = Some(worker);
        self
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(f: Arc<Fiber>) -> Task {
        Task::fiber(f)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Notifier
////////////////////////////////////////////////////////////////////////////////

/// Customization hooks the owning runtime plugs into the scheduler: how to
/// wake an idle worker, what the idle fiber does for one round, and what
/// else must drain before the scheduler may stop.
pub(crate) trait Notifier: Send + Sync {
    /// Wake one idle worker, if any.
    fn tickle(&self, sched: &Scheduler) {
        let _ = sched;
    }

    /// One round of the idle fiber's body. The default does nothing, which
    /// turns the idle fiber into a plain yield loop.
    fn idle(&self, sched: &Arc<Scheduler>) {
        let _ = sched;
    }

    /// Additional condition that must hold for [`Scheduler::stopping`].
    fn stopping(&self) -> bool {
        true
    }

    /// Runs on every worker thread before its dispatch loop starts.
    fn on_worker_start(&self) {}
}

struct NullNotifier;

impl Notifier for NullNotifier {}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    /// Number of spawned workers; the caller thread is not counted here.
    thread_count: usize,
    use_caller: bool,
    root_fiber: Option<Arc<Fiber>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    /// True before `start` and again once `stop` has been requested.
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    notifier: Box<dyn Notifier>,
    me: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// With `use_caller` the constructing thread counts as one of the
    /// workers (slot `0`); the remaining `threads - 1` are spawned by
    /// [`Scheduler::start`]. The caller's share of the dispatching happens
    /// inside [`Scheduler::stop`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::new_with_notifier(threads, use_caller, name, Box::new(NullNotifier))
    }

    pub(crate) fn new_with_notifier(
        threads: usize,
        use_caller: bool,
        name: &str,
        notifier: Box<dyn Notifier>,
    ) -> Arc<Scheduler> {
        assert!(threads >= 1);
        let name = if name.is_empty() { "sched" } else { name }.to_string();

        if use_caller {
            fiber::current();
            assert!(
                Scheduler::current().is_none(),
                "thread already participates in a scheduler"
            );
        }
        let spawn_count = if use_caller { threads - 1 } else { threads };

        let sched = Arc::new_cyclic(|me: &Weak<Scheduler>| {
            let root_fiber = if use_caller {
                let weak = me.clone();
                Some(Fiber::new_with(
                    move || {
                        let sched = weak.upgrade().expect("scheduler dropped before running");
                        sched.run(0);
                    },
                    0,
                    true,
                ))
            } else {
                None
            };
            Scheduler {
                name,
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count: spawn_count,
                use_caller,
                root_fiber,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                notifier,
                me: me.clone(),
            }
        });

        if use_caller {
            SCHEDULER.with(|s| *s.borrow_mut() = Some(sched.clone()));
            SCHED_FIBER.with(|f| *f.borrow_mut() = sched.root_fiber.clone());
            WORKER_ID.with(|w| w.set(Some(0)));
        }
        debug!(
            "scheduler {} created, workers={}, use_caller={}",
            sched.name,
            sched.worker_count(),
            use_caller
        );
        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of worker slots, the caller thread included.
    pub fn worker_count(&self) -> usize {
        self.thread_count + self.use_caller as usize
    }

    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    /// The scheduler the calling thread works for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        SCHEDULER.with(|s| s.borrow().clone())
    }

    /// Spawn the worker threads. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        if !self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        assert!(threads.is_empty());
        for i in 0..self.thread_count {
            let id = if self.use_caller { i + 1 } else { i };
            let sched = self.me.upgrade().expect("scheduler gone during start");
            threads.push(Thread::spawn(&format!("{}_{}", self.name, id), move || {
                sched.run(id)
            }));
        }
    }

    /// Enqueue one task. Submission from outside any worker is legal.
    pub fn schedule(&self, task: impl Into<Task>) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task.into());
            was_empty
        };
        if need_tickle {
            self.notifier.tickle(self);
        }
    }

    /// Enqueue a batch atomically with respect to other submissions.
    pub fn schedule_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(tasks);
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.notifier.tickle(self);
        }
    }

    /// Run `f` as a new task on any worker.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::callback(f));
    }

    /// Re-enqueue the current fiber pinned to `worker` (or unpinned) and
    /// yield; when the fiber resumes it runs on the requested worker.
    pub fn switch_to(&self, worker: Option<usize>) {
        if let Some(cur) = Scheduler::current() {
            if Arc::as_ptr(&cur) == self as *const Scheduler {
                match worker {
                    None => return,
                    Some(w) if Some(w) == worker_id() => return,
                    _ => {}
                }
            }
        }
        let mut task = Task::fiber(fiber::current());
        if let Some(w) = worker {
            task = task.pinned(w);
        }
        self.schedule(task);
        fiber::yield_to_hold();
    }

    /// True once a requested stop may actually complete: stop requested, no
    /// ready tasks, no worker mid-task, and the notifier has nothing pending.
    pub fn stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
            && self.notifier.stopping()
    }

    /// Cooperative shutdown: waits for the queue and all in-flight work to
    /// drain, drives the caller-thread dispatch fiber if there is one, then
    /// joins the workers.
    ///
    /// With `use_caller` this must run on the constructing thread, and the
    /// dispatch fiber is always driven to completion here before the workers
    /// are joined.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        // Already fully stopped (or never started with nothing to run):
        // nothing to drive or join.
        if self.stop_requested.load(Ordering::SeqCst)
            && self.threads.lock().unwrap().is_empty()
            && self
                .root_fiber
                .as_ref()
                .map_or(true, |root| root.state().is_terminal())
        {
            self.clear_caller_tls();
            return;
        }

        if let Some(root) = &self.root_fiber {
            if self.thread_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                self.stop_requested.store(true, Ordering::SeqCst);
                if self.stopping() {
                    info!("scheduler {} stopped", self.name);
                    self.clear_caller_tls();
                    return;
                }
            }
        }

        let me = self as *const Scheduler;
        if self.use_caller {
            assert!(
                Scheduler::current().map_or(false, |s| Arc::as_ptr(&s) == me),
                "stop of a use_caller scheduler must run on its own thread"
            );
        } else {
            assert!(
                Scheduler::current().map_or(true, |s| Arc::as_ptr(&s) != me),
                "stop must not run on one of the scheduler's workers"
            );
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.notifier.tickle(self);
        }
        if self.root_fiber.is_some() {
            self.notifier.tickle(self);
        }

        if let Some(root) = &self.root_fiber {
            if !self.stopping() {
                root.resume();
            }
        }

        let threads: Vec<Thread> = {
            let mut lock = self.threads.lock().unwrap();
            lock.drain(..).collect()
        };
        for t in threads {
            t.join();
        }

        self.clear_caller_tls();
        info!("scheduler {} stopped", self.name);
    }

    /// Release the constructing thread's handles so the scheduler can be
    /// dropped and the thread reused by a future scheduler.
    fn clear_caller_tls(&self) {
        let me = self as *const Scheduler;
        if Scheduler::current().map_or(false, |s| Arc::as_ptr(&s) == me) {
            SCHEDULER.with(|s| {
                s.borrow_mut().take();
            });
            SCHED_FIBER.with(|f| {
                f.borrow_mut().take();
            });
            WORKER_ID.with(|w| w.set(None));
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Dispatch
    ////////////////////////////////////////////////////////////////////////

    fn run(self: Arc<Self>, worker: usize) {
        debug!("scheduler {} worker {} running", self.name, worker);
        SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        WORKER_ID.with(|w| w.set(Some(worker)));
        self.notifier.on_worker_start();
        if !(self.use_caller && worker == 0) {
            // The dispatch loop lives on this thread's native stack.
            SCHED_FIBER.with(|f| *f.borrow_mut() = Some(fiber::current()));
        }

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || idle_main(sched))
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock().unwrap();
                let mut idx = 0;
                while idx < queue.len() {
                    if let Some(a) = queue[idx].affinity {
                        if a != worker {
                            // Someone else's work; make sure they hear about it.
                            tickle_me = true;
                            idx += 1;
                            continue;
                        }
                    }
                    if let TaskKind::Fiber(f) = &queue[idx].kind {
                        // Still running, or mid-save on another worker.
                        if f.state() == FiberState::Exec || !f.is_stealable() {
                            idx += 1;
                            continue;
                        }
                    }
                    task = queue.remove(idx);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if task.is_some() && idx < queue.len() {
                    tickle_me = true;
                }
            }
            if tickle_me {
                self.notifier.tickle(&self);
            }

            match task {
                Some(Task {
                    kind: TaskKind::Fiber(f),
                    ..
                }) => {
                    if !f.state().is_terminal() {
                        f.swap_in();
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        match f.state() {
                            FiberState::Ready => self.schedule(Task::fiber(f)),
                            FiberState::Term | FiberState::Except => {}
                            // Hold was recorded by the yield itself; the
                            // fiber may already be running again elsewhere,
                            // so its state is not ours to touch anymore.
                            _ => {}
                        }
                    } else {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(Task {
                    kind: TaskKind::Callback(cb),
                    ..
                }) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::new_boxed(cb),
                    };
                    f.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        FiberState::Ready => self.schedule(Task::fiber(f)),
                        FiberState::Term | FiberState::Except => {
                            // Keep the wrapper for the next bare closure.
                            cb_fiber = Some(f);
                        }
                        _ => {}
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        debug!("scheduler {} worker {} idle fiber done", self.name, worker);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    if !idle_fiber.state().is_terminal() {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }

        if !(self.use_caller && worker == 0) {
            SCHEDULER.with(|s| s.borrow_mut().take());
            SCHED_FIBER.with(|f| f.borrow_mut().take());
            WORKER_ID.with(|w| w.set(None));
        }
        debug!("scheduler {} worker {} exiting", self.name, worker);
    }
}

fn idle_main(sched: Arc<Scheduler>) {
    debug!("scheduler {} idle fiber started", sched.name());
    while !sched.stopping() {
        sched.notifier.idle(&sched);
        fiber::yield_to_hold();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count())
            .field("active", &self.active.load(Ordering::SeqCst))
            .field("idle", &self.idle.load(Ordering::SeqCst))
            .field("ready", &self.queue.lock().unwrap().len())
            .field("stop_requested", &self.stop_requested.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        assert!(
            self.stop_requested.load(Ordering::SeqCst),
            "scheduler {} dropped while running",
            self.name
        );
    }
}

////////////////////////////////////////////////////////////////////////////////
// Worker-thread lookups
////////////////////////////////////////////////////////////////////////////////

/// The fiber hosting this thread's dispatch loop. Falls back to the
/// thread-root fiber on threads that run no scheduler, which makes plain
/// [`fiber::yield_to_hold`] work anywhere.
pub fn scheduling_fiber() -> Arc<Fiber> {
    SCHED_FIBER
        .with(|f| f.borrow().clone())
        .unwrap_or_else(fiber::thread_fiber)
}

/// Slot index of the calling worker within its scheduler, if any.
pub fn worker_id() -> Option<usize> {
    WORKER_ID.with(|w| w.get())
}
