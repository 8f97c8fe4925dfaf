//! Monotonic time helpers.
//!
//! All scheduling deadlines in this crate are measured on `CLOCK_MONOTONIC`
//! in millisecond resolution.

/// Milliseconds since an arbitrary fixed point in the past.
#[inline(always)]
pub fn now_ms() -> u64 {
    now_ns() / 1_000_000
}

/// Microseconds since an arbitrary fixed point in the past.
#[inline(always)]
pub fn now_us() -> u64 {
    now_ns() / 1_000
}

#[inline]
fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
