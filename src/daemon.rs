//! Process supervisor.
//!
//! [`start_daemon`] runs the server's main function either inline or under a
//! respawning parent: the parent detaches from the terminal, forks a child
//! per generation and restarts it after a crash, pausing
//! `daemon.restart_interval` seconds between generations. The supervised
//! child is an ordinary process and starts its schedulers itself.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use once_cell::sync::Lazy;

use crate::config::Config;

#[derive(Clone, Debug, Default)]
pub struct ProcessInfo {
    pub parent_id: libc::pid_t,
    pub main_id: libc::pid_t,
    pub parent_start_time: u64,
    pub main_start_time: u64,
    pub restart_count: u32,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parent_id={} main_id={} parent_start_time={} main_start_time={} restart_count={}",
            self.parent_id,
            self.main_id,
            self.parent_start_time,
            self.main_start_time,
            self.restart_count
        )
    }
}

static PROCESS_INFO: Lazy<Mutex<ProcessInfo>> = Lazy::new(Default::default);

/// Snapshot of the supervisor's view of this process.
pub fn process_info() -> ProcessInfo {
    PROCESS_INFO.lock().unwrap().clone()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Run `main_cb`, optionally under a respawning daemon parent.
///
/// Returns the main function's exit code (in the child, when daemonized),
/// `0` from the parent after a clean child exit, or `-1` on a supervisor
/// failure.
pub fn start_daemon<F>(main_cb: F, daemonize: bool) -> i32
where
    F: Fn() -> i32,
{
    if !daemonize {
        {
            let mut info = PROCESS_INFO.lock().unwrap();
            info.parent_id = unsafe { libc::getpid() };
            info.parent_start_time = unix_now();
        }
        return real_start(&main_cb);
    }

    if unsafe { libc::daemon(1, 0) } != 0 {
        error!(
            "daemon(3) failed: {}",
            std::io::Error::last_os_error()
        );
        return -1;
    }
    {
        let mut info = PROCESS_INFO.lock().unwrap();
        info.parent_id = unsafe { libc::getpid() };
        info.parent_start_time = unix_now();
    }

    loop {
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            return real_start(&main_cb);
        }
        if pid < 0 {
            error!("fork failed: {}", std::io::Error::last_os_error());
            return -1;
        }

        let mut status: libc::c_int = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        if status == 0 {
            info!("child finished pid={}", pid);
            break;
        }
        error!("child crashed pid={} status={}", pid, status);
        PROCESS_INFO.lock().unwrap().restart_count += 1;
        std::thread::sleep(Duration::from_secs(
            Config::get().daemon.restart_interval as u64,
        ));
    }
    0
}

fn real_start<F>(main_cb: &F) -> i32
where
    F: Fn() -> i32,
{
    {
        let mut info = PROCESS_INFO.lock().unwrap();
        info.main_id = unsafe { libc::getpid() };
        info.main_start_time = unix_now();
    }
    info!("process start pid={}", unsafe { libc::getpid() });
    main_cb()
}
