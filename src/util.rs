//! Small syscall helpers shared across the runtime.

use std::io;

/// Milliseconds elapsed on the raw monotonic clock.
///
/// CLOCK_MONOTONIC_RAW is immune to NTP slewing; the timer manager still
/// guards against the rare kernels where the reading jumps backwards.
pub fn current_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rt = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    assert_eq!(rt, 0, "clock_gettime(CLOCK_MONOTONIC_RAW) failed");
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Kernel thread id of the calling thread.
pub fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// The calling thread's errno value.
pub fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Overwrite the calling thread's errno, as the hooked syscalls must when
/// they synthesize a failure (e.g. ETIMEDOUT) without entering the kernel.
pub fn set_errno(value: i32) {
    unsafe {
        *libc::__errno_location() = value;
    }
}
