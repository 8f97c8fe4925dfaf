use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use fibrio::fiber;
use fibrio::reactor::{Event, IoManager};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn pipe_nonblock() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn write_byte(fd: RawFd) {
    let byte = [1u8];
    let rc = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rc, 1);
}

#[test]
fn callback_waiter_fires_on_readiness() {
    let io = IoManager::new(2, false, "cb_ready").unwrap();
    let (r, w) = pipe_nonblock();

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    io.add_event_with(r, Event::READ, move || {
        fired2.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_event_count(), 1);

    write_byte(w);
    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));
    assert!(wait_until(Duration::from_secs(1), || {
        io.pending_event_count() == 0
    }));

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn fiber_waiter_is_woken_and_reads() {
    let io = IoManager::new(2, false, "fiber_ready").unwrap();
    let (r, w) = pipe_nonblock();
    let (tx, rx) = mpsc::channel();

    {
        let io = io.clone();
        io.clone().spawn(move || {
            io.add_event(r, Event::READ).unwrap();
            fiber::yield_to_hold();
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            tx.send(n).unwrap();
        });
    }

    // Let the fiber park before producing the byte.
    assert!(wait_until(Duration::from_secs(5), || {
        io.pending_event_count() == 1
    }));
    write_byte(w);

    let n = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, 1);
    assert_eq!(io.pending_event_count(), 0);

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn cancel_event_wakes_without_readiness() {
    let io = IoManager::new(2, false, "cancel").unwrap();
    let (r, w) = pipe_nonblock();
    let (tx, rx) = mpsc::channel();

    {
        let io = io.clone();
        io.clone().spawn(move || {
            io.add_event(r, Event::READ).unwrap();
            fiber::yield_to_hold();
            // Woken with no data: the read observes the real fd state.
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            let err = std::io::Error::last_os_error();
            tx.send((n, err.kind())).unwrap();
        });
    }

    assert!(wait_until(Duration::from_secs(5), || {
        io.pending_event_count() == 1
    }));
    assert!(io.cancel_event(r, Event::READ));

    let (n, kind) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(kind, std::io::ErrorKind::WouldBlock);
    assert_eq!(io.pending_event_count(), 0);

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn del_event_disarms_without_firing() {
    let io = IoManager::new(2, false, "del").unwrap();
    let (r, w) = pipe_nonblock();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    io.add_event_with(r, Event::READ, move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_event_count(), 1);

    assert!(io.del_event(r, Event::READ));
    assert!(!io.del_event(r, Event::READ));
    assert_eq!(io.pending_event_count(), 0);

    write_byte(w);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn cancel_all_fires_both_directions() {
    let io = IoManager::new(2, false, "cancel_all").unwrap();
    let (r, w) = pipe_nonblock();

    let fired = Arc::new(AtomicUsize::new(0));
    let f1 = fired.clone();
    let f2 = fired.clone();
    // Both directions armed on the quiet read end: neither can fire on its
    // own, only the cancel sweep wakes them.
    io.add_event_with(r, Event::READ, move || {
        f1.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    io.add_event_with(r, Event::WRITE, move || {
        f2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_event_count(), 2);

    assert!(io.cancel_all(r));
    assert!(wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(io.pending_event_count(), 0);
    assert!(!io.cancel_all(r));

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn use_caller_manager_polls_on_workers_and_stops_inline() {
    let io = IoManager::new(2, true, "uc_io").unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    // The spawned worker does the polling; the constructing thread only
    // dispatches during stop.
    io.add_timer(
        Duration::from_millis(100),
        move || {
            fired2.store(true, Ordering::SeqCst);
        },
        false,
    );
    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));
    io.stop();
    assert_eq!(io.armed_timers(), 0);
}

#[test]
fn fd_contexts_grow_for_large_descriptors() {
    let io = IoManager::new(1, false, "grow").unwrap();
    // Push the fd number well past the initial table size.
    let mut fds = Vec::new();
    for _ in 0..40 {
        let (r, w) = pipe_nonblock();
        fds.push((r, w));
    }
    let (r, w) = *fds.last().unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    io.add_event_with(r, Event::READ, move || {
        fired2.store(true, Ordering::SeqCst);
    })
    .unwrap();
    write_byte(w);
    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));
    assert_eq!(io.pending_event_count(), 0);

    io.stop();
    for (r, w) in fds {
        close_fd(r);
        close_fd(w);
    }
}
