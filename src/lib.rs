//! Stackful fibers, M:N scheduling and cooperative non-blocking I/O.
//!
//! The crate is built from three layers:
//! - [`fiber`]: stackful coroutines with explicit suspend/resume,
//! - [`scheduler`]: a worker pool dispatching fibers and closures,
//! - [`reactor`] + [`coio`]: epoll readiness and timers waking parked
//!   fibers, with socket types whose blocking calls suspend the fiber
//!   instead of the thread.
//!
//! [`config`], [`log`], [`daemon`] and [`sync`] carry the surrounding
//! plumbing: YAML configuration, the logging sink, a respawning process
//! supervisor and the thread-level primitives the runtime itself needs.

#[macro_use]
extern crate bitflags;

pub mod clock;
pub mod coio;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fiber;
pub mod log;
pub mod reactor;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod timer;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::fiber::{Fiber, FiberState};
pub use crate::reactor::{Event, IoManager};
pub use crate::scheduler::{Scheduler, Task};

pub type Result<T> = std::result::Result<T, Error>;
