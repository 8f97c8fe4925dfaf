//! Cooperative input/output.
//!
//! Fiber-suspending replacements for blocking calls. Instead of intercepting
//! libc symbols, the blocking entry points are exposed as methods on a
//! socket abstraction: a would-block result arms the matching readiness
//! event on the current [`IoManager`](crate::reactor::IoManager), parks the
//! fiber and retries after wakeup. A timeout is a condition timer that
//! cancels the armed event.
//!
//! Every function degrades gracefully outside a worker thread: with no I/O
//! manager current, waiting falls back to `poll(2)` and [`sleep`] to
//! [`std::thread::sleep`], blocking the OS thread instead of a fiber.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fiber;
use crate::reactor::{Event, IoManager};
use crate::scheduler::{Scheduler, Task};

/// Wait until `fd` reports one of `events`. Yields.
///
/// - `fd` - non-blocking file descriptor
/// - `events` - combination of [`Event::READ`] and [`Event::WRITE`]
/// - `timeout` - `None` waits forever
///
/// Returns `TimedOut` when the timeout fires first. A return of `Ok` only
/// means the waiter was woken; the caller retries its syscall and interprets
/// the result (a cancelled fd, for instance, yields an error there).
pub fn wait(fd: RawFd, events: Event, timeout: Option<Duration>) -> io::Result<()> {
    let mgr = match IoManager::current() {
        Some(m) => m,
        None => return wait_blocking(fd, events, timeout),
    };

    let timed_out = Arc::new(AtomicBool::new(false));
    let timer = timeout.map(|delay| {
        let weak_flag = Arc::downgrade(&timed_out);
        let mgr_for_cb = mgr.clone();
        mgr.add_condition_timer(
            delay,
            move || {
                if let Some(flag) = weak_flag.upgrade() {
                    // Only report a timeout if we actually cancelled the
                    // arming; otherwise the event won the race.
                    if mgr_for_cb.cancel_event(fd, events) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            },
            Arc::downgrade(&timed_out),
            false,
        )
    });

    if let Err(e) = mgr.add_event(fd, events) {
        if let Some(t) = &timer {
            mgr.cancel_timer(t);
        }
        return Err(e.into());
    }

    fiber::yield_to_hold();

    if let Some(t) = timer {
        mgr.cancel_timer(&t);
        if timed_out.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::TimedOut.into());
        }
    }
    Ok(())
}

fn wait_blocking(fd: RawFd, events: Event, timeout: Option<Duration>) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: 0,
        revents: 0,
    };
    if events.contains(Event::READ) {
        pollfd.events |= libc::POLLIN;
    }
    if events.contains(Event::WRITE) {
        pollfd.events |= libc::POLLOUT;
    }
    let timeout_ms = timeout.map_or(-1, |t| t.as_millis() as libc::c_int);
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Put the current fiber to sleep for at least `duration`, letting the
/// worker run other fibers meanwhile.
pub fn sleep(duration: Duration) {
    let mgr = match IoManager::current() {
        Some(m) => m,
        None => return std::thread::sleep(duration),
    };
    let sched = Scheduler::current().expect("io worker without a scheduler");
    let cur = fiber::current();
    mgr.add_timer(
        duration,
        move || {
            sched.schedule(Task::fiber(cur.clone()));
        },
        false,
    );
    fiber::yield_to_hold();
}

////////////////////////////////////////////////////////////////////////////////
// CoStream
////////////////////////////////////////////////////////////////////////////////

/// A non-blocking stream socket whose reads and writes park the calling
/// fiber instead of the thread.
pub struct CoStream {
    fd: RawFd,
}

impl CoStream {
    /// Take ownership of an fd-like object and switch it to non-blocking.
    pub fn new<T>(inner: T) -> io::Result<CoStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(CoStream { fd })
    }

    /// Connect to a remote TCP socket. The in-progress connect parks the
    /// fiber on a `WRITE` arming; connection errors (`ECONNREFUSED`, ...)
    /// surface once the socket reports its result.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoStream> {
        Self::connect_impl(addr, None)
    }

    /// Opens a TCP connection to a remote host with a timeout.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> io::Result<CoStream> {
        Self::connect_one(addr, Some(timeout))
    }

    fn connect_impl<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> io::Result<CoStream> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match Self::connect_one(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "could not resolve address")
        }))
    }

    fn connect_one(addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<CoStream> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stream = CoStream { fd };

        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc == 0 {
            return Ok(stream);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }

        wait(fd, Event::WRITE, timeout)?;

        let mut so_error: libc::c_int = 0;
        let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
        if unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        if so_error != 0 {
            return Err(io::Error::from_raw_os_error(so_error));
        }
        Ok(stream)
    }

    /// Pull some bytes from the socket, parking the fiber until data (or the
    /// timeout) arrives.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        read(self.fd, buf, timeout)
    }

    /// Write a buffer into the socket, parking the fiber until it accepts
    /// bytes (or the timeout fires).
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        write(self.fd, buf, timeout)
    }

    /// `recv(2)` with explicit flags.
    pub fn recv(&mut self, buf: &mut [u8], flags: i32, timeout: Option<Duration>) -> io::Result<usize> {
        retry_wouldblock(self.fd, Event::READ, timeout, || unsafe {
            libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
        })
    }

    /// `send(2)` with explicit flags.
    pub fn send(&mut self, buf: &[u8], flags: i32, timeout: Option<Duration>) -> io::Result<usize> {
        retry_wouldblock(self.fd, Event::WRITE, timeout, || unsafe {
            libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
        })
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        // Wake anything still parked on this fd before the close, so no
        // waiter is stranded on a dead descriptor.
        if let Some(mgr) = IoManager::current() {
            mgr.cancel_all(self.fd);
        }
        unsafe { libc::close(self.fd) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoListener
////////////////////////////////////////////////////////////////////////////////

/// A non-blocking TCP listener; `accept` parks the calling fiber until a
/// connection arrives.
pub struct CoListener {
    inner: TcpListener,
}

impl CoListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(CoListener { inner: listener })
    }

    /// Accept a new incoming connection from this listener.
    pub fn accept(&self) -> io::Result<CoStream> {
        self.accept_impl(None)
    }

    pub fn accept_timeout(&self, timeout: Duration) -> io::Result<CoStream> {
        self.accept_impl(Some(timeout))
    }

    fn accept_impl(&self, timeout: Option<Duration>) -> io::Result<CoStream> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => return CoStream::new(stream),
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        wait(self.inner.as_raw_fd(), Event::READ, timeout)?;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl TryFrom<TcpListener> for CoListener {
    type Error = io::Error;

    fn try_from(value: TcpListener) -> Result<Self, Self::Error> {
        value.set_nonblocking(true)?;
        Ok(CoListener { inner: value })
    }
}

impl Drop for CoListener {
    fn drop(&mut self) {
        if let Some(mgr) = IoManager::current() {
            mgr.cancel_all(self.inner.as_raw_fd());
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Raw helpers
////////////////////////////////////////////////////////////////////////////////

#[inline(always)]
pub(crate) fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry_wouldblock(fd, Event::READ, timeout, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

#[inline(always)]
pub(crate) fn write(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry_wouldblock(fd, Event::WRITE, timeout, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Try the syscall; on `EWOULDBLOCK` park on `event` and retry. Spurious
/// wakeups (a cancelled event) loop back into the syscall, which then
/// reports the fd's real condition.
fn retry_wouldblock<F>(
    fd: RawFd,
    event: Event,
    timeout: Option<Duration>,
    mut syscall: F,
) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    loop {
        let rc = syscall();
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        wait(fd, event, timeout)?;
    }
}
