//! Multi-threaded cooperative fiber scheduler.
//!
//! N worker threads drain one shared task queue. A task is either a fiber
//! or a plain callback, optionally pinned to one worker's thread id. Each
//! worker runs [`Scheduler::run`]: pick the first eligible task, resume it,
//! repeat; with an empty queue it resumes a per-worker *idle fiber* which
//! either busy-yields (plain scheduler) or blocks in `epoll_wait` (when an
//! [`IoManager`](crate::IoManager) backs the scheduler).
//!
//! With `use_caller` the constructing thread contributes itself as one of
//! the workers: a *root fiber* runs the scheduling loop and is entered when
//! [`Scheduler::stop`] drains the queue before returning.
//!
//! # Example
//!
//! ```no_run
//! use spindle::Scheduler;
//!
//! let sched = Scheduler::new(1, true, "main");
//! sched.schedule_fn(|| println!("task 1"));
//! sched.schedule_fn(|| println!("task 2"));
//! sched.start();
//! sched.stop(); // caller drains the queue here
//! ```

use crate::fiber::{Fiber, State};
use crate::io::IoInner;
use crate::util;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

/// Target-thread wildcard: any worker may pick the task up.
pub const ANY_THREAD: i32 = -1;

/// One queued unit of work: a fiber or a callback, never both.
pub struct ScheduleTask {
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
    thread: i32,
}

impl ScheduleTask {
    pub fn from_fn<F>(f: F) -> ScheduleTask
    where
        F: FnOnce() + Send + 'static,
    {
        ScheduleTask {
            fiber: None,
            cb: Some(Box::new(f)),
            thread: ANY_THREAD,
        }
    }

    pub fn from_fiber(fiber: Arc<Fiber>) -> ScheduleTask {
        ScheduleTask {
            fiber: Some(fiber),
            cb: None,
            thread: ANY_THREAD,
        }
    }

    /// Pin the task to the worker with kernel thread id `tid`.
    pub fn on_thread(mut self, tid: i32) -> ScheduleTask {
        self.thread = tid;
        self
    }
}

thread_local! {
    /// Scheduler this thread currently works for.
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    /// The fiber running this thread's dispatch loop: the thread main fiber
    /// on plain workers, the root fiber on a use_caller thread.
    static SCHEDULING_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

pub(crate) fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHEDULING_FIBER.with(|c| c.borrow().clone())
}

struct Inner {
    name: String,
    queue: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Spawned worker count (excludes the caller thread).
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    use_caller: bool,
    /// Kernel tid of the caller thread in use_caller mode, -1 otherwise.
    root_thread: i32,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    /// Reactor back-reference installed by IoManager; replaces the base
    /// tickle/idle/stopping behavior when present.
    reactor: OnceLock<Weak<IoInner>>,
}

/// Cheap-clone handle to a shared scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// `threads` is the total worker count; with `use_caller` one of them
    /// is the constructing thread itself. In that mode no other scheduler
    /// may already be installed on this thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0);
        let (thread_count, root_thread) = if use_caller {
            (threads - 1, util::gettid())
        } else {
            (threads, -1)
        };
        let sched = Scheduler {
            inner: Arc::new(Inner {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                use_caller,
                root_thread,
                root_fiber: Mutex::new(None),
                reactor: OnceLock::new(),
            }),
        };
        if use_caller {
            // The caller's main fiber must exist before the root fiber can
            // yield back to it.
            Fiber::current();
            assert!(
                Scheduler::current().is_none(),
                "another scheduler is already active on this thread"
            );
            CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(sched.clone()));
            let s = sched.clone();
            let root = Fiber::new(move || s.run(), 0, false);
            SCHEDULING_FIBER.with(|c| *c.borrow_mut() = Some(root.clone()));
            *sched.inner.root_fiber.lock() = Some(root);
        }
        sched
    }

    /// Scheduler the current thread works for, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    /// The current thread's scheduling fiber (dispatch loop fiber).
    pub fn scheduling_fiber() -> Option<Arc<Fiber>> {
        crate::scheduler::scheduling_fiber()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_reactor(&self, reactor: Weak<IoInner>) {
        self.inner
            .reactor
            .set(reactor)
            .unwrap_or_else(|_| panic!("reactor installed twice"));
    }

    pub(crate) fn reactor(&self) -> Option<Arc<IoInner>> {
        self.inner.reactor.get().and_then(Weak::upgrade)
    }

    /// Spawn the worker threads. Must not be called after `stop`.
    pub fn start(&self) {
        log::debug!("scheduler {} start", self.inner.name);
        if self.inner.stopping.load(Ordering::SeqCst) {
            log::error!("scheduler {} started while stopping", self.inner.name);
            return;
        }
        let mut threads = self.inner.threads.lock();
        assert!(threads.is_empty(), "scheduler started twice");
        for i in 0..self.inner.thread_count {
            let s = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", self.inner.name, i))
                .spawn(move || s.run())
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Queue a task; wakes an idle worker when the queue was empty.
    pub fn schedule(&self, task: ScheduleTask) {
        let need_tickle = {
            let mut queue = self.inner.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(ScheduleTask::from_fn(f));
    }

    pub fn schedule_fiber(&self, fiber: &Arc<Fiber>) {
        self.schedule(ScheduleTask::from_fiber(fiber.clone()));
    }

    /// Queue a batch under one lock acquisition and at most one tickle.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = ScheduleTask>,
    {
        let need_tickle = {
            let mut queue = self.inner.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(tasks);
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Wake idle workers. A plain scheduler busy-yields between idle and
    /// run, so nothing to do; a reactor-backed one writes its wake pipe.
    fn tickle(&self) {
        match self.reactor() {
            Some(io) => io.tickle(),
            None => log::debug!("scheduler {} tickle", self.inner.name),
        }
    }

    /// True once `stop` was requested and no queued or running work is left.
    pub fn stopping(&self) -> bool {
        match self.reactor() {
            Some(io) => io.stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
            && self.inner.queue.lock().is_empty()
            && self.inner.active_threads.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.inner.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Request shutdown, drain remaining work and join the workers.
    ///
    /// For a use_caller scheduler this must run on the caller thread: the
    /// final draining happens inside the root fiber here.
    pub fn stop(&self) {
        log::debug!("scheduler {} stop", self.inner.name);
        if self.stopping() {
            return;
        }
        self.inner.stopping.store(true, Ordering::SeqCst);

        if self.inner.use_caller {
            assert!(
                Scheduler::current().is_some_and(|s| s.ptr_eq(self)),
                "a use_caller scheduler must be stopped from its caller thread"
            );
            assert_eq!(util::gettid(), self.inner.root_thread);
            assert!(self.inner.root_fiber.lock().is_some());
        } else {
            assert!(
                !Scheduler::current().is_some_and(|s| s.ptr_eq(self)),
                "stop called from inside one of the scheduler's own workers"
            );
        }

        for _ in 0..self.inner.thread_count {
            self.tickle();
        }
        let root = self.inner.root_fiber.lock().clone();
        if root.is_some() {
            self.tickle();
        }
        if let Some(root) = root {
            // The caller becomes a worker until the queue runs dry.
            root.resume();
            log::debug!("scheduler {} root fiber finished", self.inner.name);
        }

        let handles: Vec<JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        if self.inner.use_caller {
            // The original clears its thread-local in the destructor; done
            // here so the caller thread can host a later scheduler.
            CURRENT_SCHEDULER.with(|c| {
                let mut cur = c.borrow_mut();
                if cur.as_ref().is_some_and(|s| s.ptr_eq(self)) {
                    *cur = None;
                }
            });
            SCHEDULING_FIBER.with(|c| *c.borrow_mut() = None);
        }
    }

    /// The dispatch loop every worker (and the root fiber) executes.
    fn run(&self) {
        log::debug!("scheduler {} run on thread {}", self.inner.name, util::gettid());
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.clone()));
        let tid = util::gettid();
        if tid != self.inner.root_thread {
            // Plain worker: the dispatch loop runs on the thread's original
            // stack, so the main fiber doubles as the scheduling fiber.
            SCHEDULING_FIBER.with(|c| *c.borrow_mut() = Some(Fiber::current()));
        }

        let sched = self.clone();
        let idle_fiber = Fiber::new(move || sched.idle(), 0, true);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<ScheduleTask> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.inner.queue.lock();
                let mut i = 0;
                while i < queue.len() {
                    // Pinned to another worker: leave it, but remember to
                    // wake the others.
                    if queue[i].thread != ANY_THREAD && queue[i].thread != tid {
                        i += 1;
                        tickle_me = true;
                        continue;
                    }
                    debug_assert!(queue[i].fiber.is_some() || queue[i].cb.is_some());
                    if let Some(fiber) = &queue[i].fiber {
                        let state = fiber.state();
                        assert_ne!(state, State::Term, "terminated fiber in the queue");
                        if state == State::Running {
                            // Woken before its previous worker finished
                            // switching away; the saved context is not
                            // complete yet. Come back for it.
                            i += 1;
                            tickle_me = true;
                            continue;
                        }
                    }
                    task = queue.remove(i);
                    self.inner.active_threads.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= !queue.is_empty();
            }
            if tickle_me {
                self.tickle();
            }

            if let Some(mut task) = task {
                if let Some(fiber) = task.fiber.take() {
                    // Returns once the fiber terminated or yielded; either
                    // way this dispatch is done.
                    fiber.resume();
                    self.inner.active_threads.fetch_sub(1, Ordering::SeqCst);
                } else if let Some(cb) = task.cb.take() {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, 0, true),
                    };
                    fiber.resume();
                    self.inner.active_threads.fetch_sub(1, Ordering::SeqCst);
                    if fiber.state() == State::Term {
                        // Keep the stack for the next callback task.
                        cb_fiber = Some(fiber);
                    }
                }
            } else {
                if idle_fiber.state() == State::Term {
                    log::debug!("scheduler {} idle fiber terminated", self.inner.name);
                    break;
                }
                self.inner.idle_threads.fetch_add(1, Ordering::SeqCst);
                // Recheck after publishing idleness: a task enqueued in the
                // window since the scan saw nothing would find no idle
                // worker to tickle and wait out a full epoll timeout. Only
                // tasks this thread could dequeue count; a task pinned
                // elsewhere is its own worker's problem and must not keep
                // this one spinning instead of blocking.
                let eligible = self
                    .inner
                    .queue
                    .lock()
                    .iter()
                    .any(|t| t.thread == ANY_THREAD || t.thread == tid);
                if eligible {
                    self.inner.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                idle_fiber.resume();
                self.inner.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
        log::debug!("scheduler {} run exit on thread {}", self.inner.name, tid);
    }

    /// Body of the per-worker idle fiber.
    fn idle(&self) {
        match self.reactor() {
            Some(io) => io.idle(),
            None => {
                // Busy-poll: bounce between the dispatch loop and here until
                // shutdown. Intentional for the plain scheduler.
                while !self.stopping() {
                    Fiber::yield_now();
                }
            }
        }
    }
}
