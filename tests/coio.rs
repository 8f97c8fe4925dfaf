use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use fibrio::coio::{self, CoListener, CoStream};
use fibrio::reactor::{Event, IoManager};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A local port that nothing listens on (freshly bound then released).
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn connect_to_dead_port_parks_then_fails() {
    let io = IoManager::new(2, false, "refused").unwrap();
    let port = free_port();
    let (tx, rx) = mpsc::channel();

    io.spawn(move || {
        let result = CoStream::connect(("127.0.0.1", port));
        tx.send(result.err().map(|e| e.kind())).unwrap();
    });

    let kind = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, Some(std::io::ErrorKind::ConnectionRefused));
    assert!(wait_until(Duration::from_secs(1), || {
        io.pending_event_count() == 0
    }));
    io.stop();
}

#[test]
fn read_timeout_reports_timed_out() {
    let io = IoManager::new(2, false, "rto").unwrap();
    let (quiet, _peer) = UnixStream::pair().unwrap();
    let (tx, rx) = mpsc::channel();

    io.spawn(move || {
        let mut stream = CoStream::new(quiet).unwrap();
        let mut buf = [0u8; 4];
        let started = Instant::now();
        let result = stream.read_with_timeout(&mut buf, Some(Duration::from_millis(150)));
        tx.send((result.err().map(|e| e.kind()), started.elapsed()))
            .unwrap();
    });

    let (kind, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, Some(std::io::ErrorKind::TimedOut));
    assert!(elapsed >= Duration::from_millis(100));
    assert_eq!(io.pending_event_count(), 0);
    assert_eq!(io.armed_timers(), 0);
    io.stop();
}

#[test]
fn wait_falls_back_to_poll_without_a_manager() {
    // No manager TLS on this thread: wait must degrade to poll(2).
    let (quiet, _peer) = UnixStream::pair().unwrap();
    let started = Instant::now();
    let err = coio::wait(
        quiet.as_raw_fd(),
        Event::READ,
        Some(Duration::from_millis(100)),
    )
    .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[test]
fn sleeping_fibers_share_one_worker() {
    let io = IoManager::new(1, false, "sleepers").unwrap();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    for _ in 0..2 {
        let tx = tx.clone();
        io.spawn(move || {
            coio::sleep(Duration::from_millis(200));
            tx.send(()).unwrap();
        });
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = started.elapsed();
    // Both slept in parallel on the single worker.
    assert!(elapsed >= Duration::from_millis(180));
    assert!(elapsed < Duration::from_millis(390), "slept serially: {:?}", elapsed);
    io.stop();
}

#[test]
fn accept_timeout_expires_without_clients() {
    let io = IoManager::new(2, false, "accept_to").unwrap();
    let listener = CoListener::bind("127.0.0.1:0").unwrap();
    let (tx, rx) = mpsc::channel();

    io.spawn(move || {
        let result = listener.accept_timeout(Duration::from_millis(150));
        tx.send(result.err().map(|e| e.kind())).unwrap();
    });

    let kind = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, Some(std::io::ErrorKind::TimedOut));
    assert_eq!(io.pending_event_count(), 0);
    io.stop();
}

#[test]
fn write_then_shutdown_is_seen_as_eof() {
    let io = IoManager::new(2, false, "eof").unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let (tx, rx) = mpsc::channel();

    io.spawn(move || {
        let mut stream = CoStream::new(a).unwrap();
        let mut buf = [0u8; 16];
        let n = stream
            .recv(&mut buf, 0, Some(Duration::from_secs(5)))
            .unwrap();
        let first = buf[..n].to_vec();
        let eof = stream.read(&mut buf).unwrap();
        tx.send((first, eof)).unwrap();
    });

    let mut b = b;
    b.write_all(b"ping").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    drop(b);

    let (first, eof) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, b"ping");
    assert_eq!(eof, 0);
    io.stop();
}
