//! Logging backend. See the ["log" crate documentation](https://docs.rs/log/)
//! for the macros; this module only supplies the sink.
//!
//! Example:
//! ```no_run
//! use log::info;
//!
//! fibrio::log::init().unwrap();
//! info!("hello");
//! ```
//!
//! Each line carries the wall-clock time, level, thread name, current fiber
//! id and target, so interleaved worker output stays attributable.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Log, Metadata, Record, SetLoggerError};

use crate::config::Config;
use crate::fiber;
use crate::sync::SpinLock;
use crate::thread::Thread;

/// [`Log`](https://docs.rs/log/latest/log/trait.Log.html) implementation
/// writing formatted lines to stderr.
pub struct StderrLogger {
    lock: SpinLock,
}

static LOGGER: StderrLogger = StderrLogger {
    lock: SpinLock::new(),
};

/// Install the stderr logger with the level from [`Config::get`].
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(Config::get().log.level_filter());
    Ok(())
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "[{}.{:03}] [{:5}] [{}:{}] {}: {}\n",
            now.as_secs(),
            now.subsec_millis(),
            record.level(),
            Thread::current_name(),
            fiber::current_id(),
            record.target(),
            record.args()
        );
        // One writer at a time keeps lines whole across workers.
        let _guard = self.lock.lock();
        let _ = io::stderr().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_installs_exactly_once() {
        assert!(init().is_ok());
        assert!(init().is_err());
        log::info!("logger smoke line");
        log::logger().flush();
    }
}
