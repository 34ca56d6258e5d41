//! Blocking-syscall hooks.
//!
//! Use these functions instead of raw libc calls when running inside the
//! runtime: where libc would block the whole worker thread, these suspend
//! only the calling fiber and let the reactor resume it on readiness or
//! timeout. Every function keeps the POSIX convention (`-1` with errno on
//! failure) because it stands in for the syscall it names.
//!
//! Interception is gated per thread by [`set_hook_enable`]; while disabled
//! (the default) every call delegates verbatim to libc.

use crate::fd::{TimeoutKind, fd_manager};
use crate::fiber::Fiber;
use crate::io::{Event, IoManager};
use crate::util::{errno, set_errno};
use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t};
use std::any::Any;
use std::cell::Cell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked calls on this thread yield instead of blocking.
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Toggle interception for the calling thread.
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLED.with(|c| c.set(enable));
}

/// Default connect timeout, ms.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Sentinel for "no timeout".
const NO_TIMEOUT: u64 = u64::MAX;

fn connect_timeout_knob() -> &'static AtomicU64 {
    static KNOB: OnceLock<AtomicU64> = OnceLock::new();
    KNOB.get_or_init(|| {
        let ms = std::env::var("SPINDLE_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        AtomicU64::new(ms)
    })
}

/// Timeout applied by the hooked `connect`, if any.
pub fn tcp_connect_timeout() -> Option<u64> {
    let ms = connect_timeout_knob().load(Ordering::Relaxed);
    (ms != NO_TIMEOUT).then_some(ms)
}

/// Change the hooked `connect` timeout; `None` waits forever.
pub fn set_tcp_connect_timeout(ms: Option<u64>) {
    connect_timeout_knob().store(ms.unwrap_or(NO_TIMEOUT), Ordering::Relaxed);
}

/// Shared between a suspended I/O call and its watchdog timer. A non-zero
/// value is the errno the wait was cancelled with.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The yield-and-retry template shared by every hooked I/O call.
///
/// `f` issues the real non-blocking syscall; `event` is the readiness that
/// unblocks it; `kind` selects which stored socket timeout arms the
/// watchdog.
fn do_io<F>(fd: RawFd, event: Event, kind: TimeoutKind, mut f: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enable() {
        return f();
    }
    let Some(ctx) = fd_manager().get(fd, true) else {
        return f();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_pollable() || ctx.user_nonblock() {
        return f();
    }

    let timeout = ctx.timeout(kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park this fiber on the event, optionally guarded by
        // the fd's recv/send timeout.
        let iom = IoManager::current().expect("hooked I/O outside an IoManager worker");
        let timer = timeout.map(|to| {
            let winfo = Arc::downgrade(&tinfo);
            let cancel_iom = iom.clone();
            let tinfo_any: Arc<dyn Any + Send + Sync> = tinfo.clone();
            let cond: Weak<dyn Any + Send + Sync> = Arc::downgrade(&tinfo_any);
            iom.add_condition_timer(
                to,
                move || {
                    let Some(t) = winfo.upgrade() else { return };
                    if t.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    cancel_iom.cancel_event(fd, event);
                },
                cond,
                false,
            )
        });

        if let Err(err) = iom.add_event(fd, event) {
            log::error!("do_io add_event(fd={}, {:?}): {}", fd, event, err);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return -1;
        }

        Fiber::yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Woken by readiness (or a cancel without verdict): try again.
    }
}

/// Reschedule the current fiber after `ms` and yield until then.
fn sleep_ms(ms: u64) {
    let fiber = Fiber::current();
    let iom = IoManager::current().expect("hooked sleep outside an IoManager worker");
    let sched = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || {
            sched.schedule_fiber(&fiber);
        },
        false,
    );
    Fiber::yield_now();
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enable() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: c_uint) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> c_int {
    if !is_hook_enable() {
        let rem = rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec);
        return unsafe { libc::nanosleep(req, rem) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_hook_enable() || fd == -1 {
        return fd;
    }
    fd_manager().get(fd, true);
    fd
}

/// `connect` with an explicit timeout (`None` = wait forever).
///
/// # Safety
/// `addr` must point to a valid sockaddr of `addrlen` bytes.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = fd_manager().get(fd, true) else {
        return unsafe { libc::connect(fd, addr, addrlen) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    } else if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: writability reports the outcome.
    let iom = IoManager::current().expect("hooked connect outside an IoManager worker");
    let tinfo = Arc::new(TimerInfo::default());
    let timer = timeout_ms.map(|to| {
        let winfo = Arc::downgrade(&tinfo);
        let cancel_iom = iom.clone();
        let tinfo_any: Arc<dyn Any + Send + Sync> = tinfo.clone();
        let cond: Weak<dyn Any + Send + Sync> = Arc::downgrade(&tinfo_any);
        iom.add_condition_timer(
            to,
            move || {
                let Some(t) = winfo.upgrade() else { return };
                if t.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                cancel_iom.cancel_event(fd, Event::Write);
            },
            cond,
            false,
        )
    });

    match iom.add_event(fd, Event::Write) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            if tinfo.cancelled.load(Ordering::SeqCst) != 0 {
                set_errno(tinfo.cancelled.load(Ordering::SeqCst));
                return -1;
            }
        }
        Err(err) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect add_event(fd={}, Write): {}", fd, err);
        }
    }

    let mut error: c_int = 0;
    let mut len = size_of::<c_int>() as socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    } == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
/// `addr` must point to a valid sockaddr of `addrlen` bytes.
pub unsafe fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    unsafe { connect_with_timeout(fd, addr, addrlen, tcp_connect_timeout()) }
}

/// # Safety
/// `addr`/`addrlen` follow the `accept(2)` contract (both may be null).
pub unsafe fn accept(s: RawFd, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(s, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(s, addr, addrlen) as isize
    }) as c_int;
    if fd >= 0 {
        fd_manager().get(fd, true);
    }
    fd
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(sockfd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
    do_io(sockfd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(sockfd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// # Safety
/// `src_addr`/`addrlen` follow the `recvfrom(2)` contract.
pub unsafe fn recvfrom(
    sockfd: RawFd,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    do_io(sockfd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(sockfd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(sockfd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(sockfd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(s: RawFd, buf: &[u8], flags: c_int) -> isize {
    do_io(s, Event::Write, TimeoutKind::Send, || unsafe {
        libc::send(s, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// # Safety
/// `to` must point to a valid sockaddr of `tolen` bytes.
pub unsafe fn sendto(
    s: RawFd,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> isize {
    do_io(s, Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(s, msg, len, flags, to, tolen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(s: RawFd, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(s, Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(s, msg, flags)
    })
}

/// Cancels anything still parked on the fd (the waiters resume and observe
/// EBADF on retry), forgets the FdCtx, then really closes.
pub fn close(fd: RawFd) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::close(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl` for the int-argument commands.
///
/// F_SETFL keeps the application's O_NONBLOCK wish on the FdCtx while the
/// real flag stays pinned to whatever the runtime needs; F_GETFL reports
/// the application's view. Lock commands go through [`fcntl_ptr`].
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = fd_manager().get(fd, false) else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            if ctx.is_closed() || !ctx.is_pollable() {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            }
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let Some(ctx) = fd_manager().get(fd, false) else {
                return flags;
            };
            if flags == -1 || ctx.is_closed() || !ctx.is_pollable() {
                return flags;
            }
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Pass-through `fcntl` for pointer-argument commands (F_SETLK and kin).
///
/// # Safety
/// `arg` must match what the command expects.
pub unsafe fn fcntl_ptr(fd: RawFd, cmd: c_int, arg: *mut c_void) -> c_int {
    unsafe { libc::fcntl(fd, cmd, arg) }
}

/// Hooked `ioctl`: FIONBIO records the application's non-blocking wish.
///
/// # Safety
/// `arg` must match what the request expects.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_pollable() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/// # Safety
/// `optval`/`optlen` follow the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    sockfd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(sockfd, level, optname, optval, optlen) }
}

/// Hooked `setsockopt`: SO_RCVTIMEO/SO_SNDTIMEO are mirrored onto the
/// FdCtx so the I/O template can arm its watchdog timer.
///
/// # Safety
/// `optval` must point to `optlen` valid bytes.
pub unsafe fn setsockopt(
    sockfd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd_manager().get(sockfd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // A zero timeval means "no timeout" to the kernel; same here.
            ctx.set_timeout(kind, (ms != 0).then_some(ms));
        }
    }
    unsafe { libc::setsockopt(sockfd, level, optname, optval, optlen) }
}
