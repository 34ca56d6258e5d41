//! Per-fd bookkeeping for the hook layer.
//!
//! Every fd the hooks have seen gets an [`FdCtx`] recording whether it can
//! take the yield-and-wait path, who asked for non-blocking mode (the
//! runtime or the application), and the socket timeouts. The process-wide
//! [`FdManager`] maps fd to context.

use parking_lot::RwLock;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Which stored socket timeout an I/O operation consults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Timeouts are stored as ms with this sentinel for "infinite".
const NO_TIMEOUT: u64 = u64::MAX;

/// State the runtime tracks for one fd.
pub struct FdCtx {
    fd: RawFd,
    /// fstat failed at creation; the fd was already dead.
    closed: bool,
    is_socket: bool,
    /// Readiness-pollable: socket or pipe. These take the hook layer's
    /// yield-and-wait path and are force-flipped to O_NONBLOCK.
    is_pollable: bool,
    /// O_NONBLOCK imposed by the runtime.
    sys_nonblock: AtomicBool,
    /// O_NONBLOCK requested by the application via fcntl/ioctl.
    user_nonblock: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let rt = unsafe { libc::fstat(fd, &mut st) };
        let (closed, is_socket, is_fifo) = if rt == -1 {
            (true, false, false)
        } else {
            let fmt = st.st_mode & libc::S_IFMT;
            (false, fmt == libc::S_IFSOCK, fmt == libc::S_IFIFO)
        };
        let ctx = FdCtx {
            fd,
            closed,
            is_socket,
            is_pollable: is_socket || is_fifo,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        };
        if ctx.is_pollable {
            // Blocking emulation happens in the runtime, never in the kernel.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            ctx.sys_nonblock.store(true, Ordering::Relaxed);
        }
        ctx
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_pollable(&self) -> bool {
        self.is_pollable
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_sys_nonblock(&self, on: bool) {
        self.sys_nonblock.store(on, Ordering::Relaxed);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Relaxed),
        };
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        let raw = ms.unwrap_or(NO_TIMEOUT);
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(raw, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout.store(raw, Ordering::Relaxed),
        }
    }
}

/// Process-wide fd → [`FdCtx`] table; dense vector, 1.5× growth.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            fds: RwLock::new(vec![None; 64]),
        }
    }

    /// Look an fd up, creating the context when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read();
            if let Some(Some(ctx)) = fds.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let mut fds = self.fds.write();
        // Raced with another creator between the locks.
        if let Some(Some(ctx)) = fds.get(idx) {
            return Some(ctx.clone());
        }
        if idx >= fds.len() {
            let target = (idx + 1).max(fds.len() * 3 / 2);
            fds.resize(target, None);
        }
        let ctx = Arc::new(FdCtx::new(fd));
        fds[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget an fd (on hooked close).
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write();
        if let Some(slot) = fds.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// The process-wide singleton, created on first use.
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_is_pollable_but_not_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = fd_manager().get(fds[0], true).unwrap();
        assert!(ctx.is_pollable());
        assert!(!ctx.is_socket());
        assert!(ctx.sys_nonblock());
        // The runtime flipped the real flag too.
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        fd_manager().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn get_without_create_misses() {
        // fd numbers this large are never handed out in tests
        assert!(fd_manager().get(100_000, false).is_none());
        let ctx = fd_manager().get(100_001, true).unwrap();
        assert!(ctx.is_closed());
        fd_manager().del(100_001);
    }

    #[test]
    fn timeouts_round_trip() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = fd_manager().get(fds[1], true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        ctx.set_timeout(TimeoutKind::Recv, Some(1500));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(1500));
        ctx.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        fd_manager().del(fds[1]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
