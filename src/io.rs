//! epoll-backed I/O reactor fused with the scheduler.
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle fibers block in
//! `epoll_wait` instead of busy-yielding. Fibers (or callbacks) register
//! interest in fd readiness with [`add_event`](IoManager::add_event); the
//! idle loop turns kernel readiness into scheduled tasks. A self-pipe
//! ("tickle pipe") interrupts `epoll_wait` when new work or a new earliest
//! timer arrives.
//!
//! Everything is edge-triggered: the tickle pipe is drained to EAGAIN, and
//! registered events are one-shot. They are removed from the epoll set as
//! they fire and the hook layer re-adds them per retry.

use crate::fd::fd_manager;
use crate::fiber::{Fiber, State};
use crate::scheduler::{ScheduleTask, Scheduler};
use crate::timer::{Timer, TimerCallback, TimerManager};
use crate::util;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Most readiness events accepted per `epoll_wait`.
const MAX_EVENTS: usize = 256;
/// Ceiling on the `epoll_wait` timeout, ms.
const MAX_TIMEOUT_MS: u64 = 5000;

/// Readiness event kind. Values equal the epoll bits so mask arithmetic is
/// direct.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
}

/// Who to wake when an event fires: exactly one of fiber/callback, plus the
/// scheduler that registered it (which need not be the reactor's own).
#[derive(Default)]
struct EventCtx {
    scheduler: Option<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

impl EventCtx {
    fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

#[derive(Default)]
struct FdState {
    /// Currently registered event mask (subset of EPOLLIN|EPOLLOUT).
    events: u32,
    read: EventCtx,
    write: EventCtx,
}

impl FdState {
    fn event_ctx(&mut self, event: Event) -> &mut EventCtx {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Per-fd registration state. Boxed into a grow-only vector so the raw
/// pointer handed to epoll stays valid for the manager's lifetime.
pub(crate) struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

/// Clear the fired bit and hand the waiter to its scheduler.
fn trigger_event(state: &mut FdState, event: Event) {
    assert!(
        state.events & event as u32 != 0,
        "triggering an unregistered event"
    );
    state.events &= !(event as u32);
    let ctx = state.event_ctx(event);
    let sched = ctx
        .scheduler
        .take()
        .expect("event context without a scheduler");
    if let Some(cb) = ctx.cb.take() {
        sched.schedule(ScheduleTask::from_fn(cb));
    } else if let Some(fiber) = ctx.fiber.take() {
        sched.schedule(ScheduleTask::from_fiber(fiber));
    } else {
        panic!("event context with neither fiber nor callback");
    }
    ctx.reset();
}

pub(crate) struct IoInner {
    epfd: RawFd,
    /// Self-pipe; [0] read end (non-blocking, in the epoll set), [1] write.
    tickle_fds: [RawFd; 2],
    /// Live (fd, event) registrations on behalf of this manager.
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Box<FdContext>>>,
    timers: TimerManager,
    sched: Scheduler,
}

impl Drop for IoInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        log::debug!("iomanager {} destroyed", self.sched.name());
    }
}

/// A scheduler with an embedded epoll reactor and timer set.
#[derive(Clone)]
pub struct IoManager {
    inner: Arc<IoInner>,
}

impl IoManager {
    /// Create the reactor and start its workers (the workers are running
    /// when this returns; `stop` remains explicit).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<IoManager> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut tickle_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        unsafe {
            // Read end must be non-blocking: the ET drain loop reads to EAGAIN.
            let flags = libc::fcntl(tickle_fds[0], libc::F_GETFL, 0);
            libc::fcntl(tickle_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(tickle_fds[0]);
                libc::close(tickle_fds[1]);
            }
            return Err(err);
        }

        let sched = Scheduler::new(threads, use_caller, name);
        let inner = Arc::new_cyclic(|weak: &Weak<IoInner>| {
            let weak = weak.clone();
            IoInner {
                epfd,
                tickle_fds,
                pending_events: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
                timers: TimerManager::new(move || {
                    // A new earliest deadline: get some worker out of
                    // epoll_wait so it re-sizes its timeout.
                    if let Some(io) = weak.upgrade() {
                        io.tickle();
                    }
                }),
                sched,
            }
        });
        resize_contexts(&mut inner.fd_contexts.write(), 32);
        inner.sched.set_reactor(Arc::downgrade(&inner));

        let iom = IoManager { inner };
        log::debug!("iomanager {} created", iom.inner.sched.name());
        iom.inner.sched.start();
        Ok(iom)
    }

    /// The IoManager whose scheduler the current thread works for.
    pub fn current() -> Option<IoManager> {
        let sched = Scheduler::current()?;
        Some(IoManager {
            inner: sched.reactor()?,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.sched
    }

    pub fn stop(&self) {
        self.inner.sched.stop();
    }

    pub fn schedule(&self, task: ScheduleTask) {
        self.inner.sched.schedule(task);
    }

    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.sched.schedule_fn(f);
    }

    pub fn schedule_fiber(&self, fiber: &Arc<Fiber>) {
        self.inner.sched.schedule_fiber(fiber);
    }

    /// Register interest in `event` on `fd` and park the *current fiber* on
    /// it: when the event fires the fiber is rescheduled. The caller is
    /// expected to yield right after. Registering the same event twice is a
    /// programming error.
    pub fn add_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Like [`add_event`](IoManager::add_event) but wakes `cb` instead of a
    /// fiber.
    pub fn add_event_cb<F>(&self, fd: RawFd, event: Event, cb: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> io::Result<()> {
        assert!(fd >= 0);
        let inner = &self.inner;
        let contexts = {
            let contexts = inner.fd_contexts.read();
            if (fd as usize) < contexts.len() {
                contexts
            } else {
                drop(contexts);
                {
                    let mut contexts = inner.fd_contexts.write();
                    let target = (fd as usize + 1).max(contexts.len() * 3 / 2);
                    if contexts.len() < target {
                        resize_contexts(&mut contexts, target);
                    }
                }
                inner.fd_contexts.read()
            }
        };
        let fd_ctx = &contexts[fd as usize];
        let mut state = fd_ctx.state.lock();
        assert!(
            state.events & event as u32 == 0,
            "event {:?} registered twice on fd {}",
            event,
            fd
        );

        let op = if state.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | state.events | event as u32,
            u64: &**fd_ctx as *const FdContext as u64,
        };
        if unsafe { libc::epoll_ctl(inner.epfd, op, fd, &mut epevent) } != 0 {
            let err = io::Error::last_os_error();
            log::error!("epoll_ctl add fd={} event={:?}: {}", fd, event, err);
            return Err(err);
        }

        // The runtime owns the blocking behavior from here on.
        set_sys_nonblock(fd);

        inner.pending_events.fetch_add(1, Ordering::SeqCst);
        state.events |= event as u32;
        let ctx = state.event_ctx(event);
        debug_assert!(ctx.scheduler.is_none() && ctx.fiber.is_none() && ctx.cb.is_none());
        ctx.scheduler = Scheduler::current().or_else(|| Some(inner.sched.clone()));
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    State::Running,
                    "add_event must capture a running fiber"
                );
                ctx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Unregister without firing. Returns false when the event was not
    /// registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let inner = &self.inner;
        let contexts = inner.fd_contexts.read();
        let Some(fd_ctx) = contexts.get(fd as usize) else {
            return false;
        };
        let mut state = fd_ctx.state.lock();
        if state.events & event as u32 == 0 {
            return false;
        }

        let new_events = state.events & !(event as u32);
        if !self.reregister(fd, new_events, fd_ctx) {
            return false;
        }
        inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        state.events = new_events;
        state.event_ctx(event).reset();
        true
    }

    /// Unregister *and* fire: the stored fiber/callback is scheduled as if
    /// the event had become ready.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let inner = &self.inner;
        let contexts = inner.fd_contexts.read();
        let Some(fd_ctx) = contexts.get(fd as usize) else {
            return false;
        };
        let mut state = fd_ctx.state.lock();
        if state.events & event as u32 == 0 {
            return false;
        }

        let new_events = state.events & !(event as u32);
        if !self.reregister(fd, new_events, fd_ctx) {
            return false;
        }
        trigger_event(&mut state, event);
        inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Drop the fd from epoll and fire everything still registered on it.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let inner = &self.inner;
        let contexts = inner.fd_contexts.read();
        let Some(fd_ctx) = contexts.get(fd as usize) else {
            return false;
        };
        let mut state = fd_ctx.state.lock();
        if state.events == 0 {
            return false;
        }

        if !self.reregister(fd, 0, fd_ctx) {
            return false;
        }
        if state.events & Event::Read as u32 != 0 {
            trigger_event(&mut state, Event::Read);
            inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events & Event::Write as u32 != 0 {
            trigger_event(&mut state, Event::Write);
            inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(state.events, 0);
        true
    }

    /// epoll_ctl MOD to the residual mask, or DEL when none remains.
    fn reregister(&self, fd: RawFd, new_events: u32, fd_ctx: &FdContext) -> bool {
        let op = if new_events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | new_events,
            u64: fd_ctx as *const FdContext as u64,
        };
        if unsafe { libc::epoll_ctl(self.inner.epfd, op, fd, &mut epevent) } != 0 {
            log::error!(
                "epoll_ctl fd={} events={:#x}: {}",
                fd,
                new_events,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Deadline-driven wakeups, usually reached through this manager.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Number of live (fd, event) registrations.
    pub fn pending_events(&self) -> usize {
        self.inner.pending_events.load(Ordering::SeqCst)
    }
}

impl IoInner {
    /// Wake a worker out of `epoll_wait`. Skipped when nobody is idle: a
    /// busy worker rechecks the queue on its own.
    pub(crate) fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        debug_assert_eq!(rt, 1);
    }

    /// Shutdown requires every deadline fired and every registration
    /// delivered, on top of the base scheduler conditions.
    pub(crate) fn stopping(&self) -> bool {
        self.stopping_with_timeout().0
    }

    fn stopping_with_timeout(&self) -> (bool, Option<u64>) {
        let next = self.timers.next_timer();
        let stop = next.is_none()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping();
        (stop, next)
    }

    /// Body of every worker's idle fiber: wait for readiness or timers,
    /// convert them to scheduled tasks, yield back to the dispatch loop.
    pub(crate) fn idle(&self) {
        log::debug!("iomanager {} idle enter", self.sched.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let (stop, next_timeout) = self.stopping_with_timeout();
            if stop {
                log::debug!("iomanager {} idle exit", self.sched.name());
                break;
            }

            let rt = loop {
                let timeout = next_timeout.map_or(MAX_TIMEOUT_MS, |t| t.min(MAX_TIMEOUT_MS));
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout as i32,
                    )
                };
                if rt < 0 && util::errno() == libc::EINTR {
                    continue;
                }
                break rt;
            };
            if rt < 0 {
                log::error!(
                    "iomanager {} epoll_wait: {}",
                    self.sched.name(),
                    io::Error::last_os_error()
                );
                break;
            }

            // Deadlines first; their callbacks join the task queue.
            let expired: Vec<TimerCallback> = self.timers.list_expired();
            for cb in expired {
                self.sched.schedule(ScheduleTask::from_fn(move || (*cb)()));
            }

            for ev in &mut events[..rt as usize] {
                if ev.u64 == self.tickle_fds[0] as u64 {
                    // Nothing to process, just drain the wakeup bytes (ET).
                    let mut dummy = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            dummy.as_mut_ptr() as *mut libc::c_void,
                            dummy.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let fd_ctx = unsafe { &*(ev.u64 as *const FdContext) };
                let mut state = fd_ctx.state.lock();
                // An error or hangup must wake whoever is registered, or
                // the waiter could hang forever; let the retry observe the
                // kernel's errno.
                if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    ev.events |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events;
                }
                let mut real_events = 0u32;
                if ev.events & libc::EPOLLIN as u32 != 0 {
                    real_events |= Event::Read as u32;
                }
                if ev.events & libc::EPOLLOUT as u32 != 0 {
                    real_events |= Event::Write as u32;
                }
                if state.events & real_events == 0 {
                    continue;
                }

                // Re-register what has not fired; fired events are one-shot.
                let left_events = state.events & !real_events;
                let op = if left_events != 0 {
                    libc::EPOLL_CTL_MOD
                } else {
                    libc::EPOLL_CTL_DEL
                };
                let mut epevent = libc::epoll_event {
                    events: libc::EPOLLET as u32 | left_events,
                    u64: ev.u64,
                };
                if unsafe { libc::epoll_ctl(self.epfd, op, fd_ctx.fd, &mut epevent) } != 0 {
                    log::error!(
                        "iomanager {} epoll_ctl fd={}: {}",
                        self.sched.name(),
                        fd_ctx.fd,
                        io::Error::last_os_error()
                    );
                    continue;
                }

                if real_events & Event::Read as u32 != 0 {
                    trigger_event(&mut state, Event::Read);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real_events & Event::Write as u32 != 0 {
                    trigger_event(&mut state, Event::Write);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Work has been queued; let the dispatch loop drain it and
            // come back here when the queue is empty again.
            Fiber::yield_now();
        }
    }
}

fn resize_contexts(contexts: &mut Vec<Box<FdContext>>, size: usize) {
    for fd in contexts.len()..size {
        contexts.push(Box::new(FdContext {
            fd: fd as RawFd,
            state: Mutex::new(FdState::default()),
        }));
    }
}

/// Flip the fd itself to O_NONBLOCK and remember that the runtime (not the
/// application) did it.
fn set_sys_nonblock(fd: RawFd) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags != -1 && flags & libc::O_NONBLOCK == 0 {
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    if let Some(ctx) = fd_manager().get(fd, false) {
        ctx.set_sys_nonblock(true);
    }
}
