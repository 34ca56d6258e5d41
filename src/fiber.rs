//! Stackful fibers: context save/restore, lifecycle state machine, stack
//! allocation.
//!
//! A [`Fiber`] owns a private stack and a saved register [`Context`]. The
//! first fiber touched on a thread materializes that thread's *main fiber*
//! (no stack, no callback), which represents the thread's original stack and
//! is the place non-scheduled fibers yield back to. Fibers created with
//! `run_in_scheduler` instead yield back to the scheduling fiber of the
//! worker that resumed them.
//!
//! # Example
//!
//! ```no_run
//! use spindle::Fiber;
//!
//! let fiber = Fiber::new(|| {
//!     println!("first half");
//!     Fiber::yield_now();
//!     println!("second half");
//! }, 0, false);
//!
//! fiber.resume(); // prints "first half"
//! fiber.resume(); // prints "second half"
//! ```

use crate::arch::{self, Context};
use crate::scheduler;
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Default fiber stack size (128 KiB).
const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Process-wide fiber id source. The main fiber of each thread draws from
/// the same counter as every other fiber.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

fn stack_size_knob() -> &'static AtomicUsize {
    static KNOB: OnceLock<AtomicUsize> = OnceLock::new();
    KNOB.get_or_init(|| {
        let size = std::env::var("SPINDLE_STACK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_STACK_SIZE);
        AtomicUsize::new(size)
    })
}

/// Stack size used when `Fiber::new` is passed 0.
pub fn default_stack_size() -> usize {
    stack_size_knob().load(Ordering::Relaxed)
}

/// Override the default stack size for subsequently created fibers.
pub fn set_default_stack_size(size: usize) {
    stack_size_knob().store(size, Ordering::Relaxed);
}

/// Fiber lifecycle state.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Runnable: freshly created, reset, or suspended at a yield point.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// Callback returned; only [`Fiber::reset`] can revive it.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Term,
        }
    }
}

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// This thread's main fiber (its original stack). Created lazily by
    /// [`Fiber::current`]; yield target of non-scheduled fibers.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful coroutine.
///
/// Shared-owned: the scheduler queue, a worker's current-task slot and the
/// per-thread current-fiber slot each hold an `Arc` while they need the
/// fiber alive.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    state: std::sync::atomic::AtomicU8,
    ctx: UnsafeCell<Context>,
    /// Owned stack buffer; `None` for a thread's main fiber. The running
    /// fiber writes into it through its stack pointer.
    stack: Option<Box<[u8]>>,
    cb: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    /// Whether yield returns to the scheduling fiber (true) or to the
    /// thread's main fiber (false).
    run_in_scheduler: bool,
}

// A fiber migrates between threads only while suspended; its context,
// callback and stack are only ever touched by the thread that currently
// owns its execution.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber around `cb`.
    ///
    /// `stack_size` of 0 selects [`default_stack_size`]. `run_in_scheduler`
    /// decides the yield target, see the module docs.
    pub fn new<F>(cb: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            default_stack_size()
        } else {
            stack_size
        };
        let stack = vec![0u8; stack_size].into_boxed_slice();
        // The heap buffer address is stable across the move into the struct.
        let stack_top = (stack.as_ptr() as usize + stack_size) & !0xF;

        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            state: std::sync::atomic::AtomicU8::new(State::Ready as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            cb: UnsafeCell::new(Some(Box::new(cb))),
            run_in_scheduler,
        });
        unsafe {
            *fiber.ctx.get() = Context::new(
                stack_top,
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as u64,
            );
        }
        log::debug!("fiber {} created, stack {} bytes", fiber.id, stack_size);
        fiber
    }

    /// The main fiber representing a thread's original stack. Only
    /// [`Fiber::current`] constructs one.
    fn new_main() -> Fiber {
        Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            state: std::sync::atomic::AtomicU8::new(State::Running as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            cb: UnsafeCell::new(None),
            run_in_scheduler: false,
        }
    }

    /// The fiber currently executing on this thread.
    ///
    /// On the first call of a thread this installs the thread's main fiber
    /// as both the current fiber and the yield target of non-scheduled
    /// fibers. This is the only path that creates a main fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Arc::new(Fiber::new_main());
        log::debug!("fiber {} is the main fiber of thread {}", main.id, crate::util::gettid());
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_FIBER.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// Id of the current fiber, or 0 if this thread has not touched fibers.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transfer execution to this fiber.
    ///
    /// The caller must be the fiber this one yields back to: the worker's
    /// scheduling fiber for `run_in_scheduler` fibers, the thread's main
    /// fiber otherwise. Resuming a RUNNING or TERM fiber is a programming
    /// error.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            State::Ready,
            "fiber {} resumed while {:?}",
            self.id,
            self.state()
        );
        // Make sure this thread has a main fiber to fall back to.
        Fiber::current();
        let save = self.return_fiber();
        set_current(self.clone());
        self.set_state(State::Running);
        arch::context_switch(save.ctx.get(), self.ctx.get());
        // Back here once the fiber yielded or terminated. READY is
        // published only now that the suspended context is fully saved;
        // a waker may already have queued the fiber on another worker.
        if self.state() == State::Running {
            self.set_state(State::Ready);
        }
    }

    /// Suspend the current fiber and return to its scheduling or main fiber.
    pub fn yield_now() {
        let cur = CURRENT
            .with(|c| c.borrow().clone())
            .expect("yield_now outside of any fiber");
        cur.yield_inner();
    }

    fn yield_inner(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "fiber {} yielded while {:?}",
            self.id,
            state
        );
        let ret = self.return_fiber();
        assert!(
            !std::ptr::eq(self, Arc::as_ptr(&ret)),
            "a thread's main fiber has nothing to yield to"
        );
        // The RUNNING→READY transition is published by the resumer after
        // this switch completes, never here: the context is still being
        // saved while this call unwinds.
        set_current(ret.clone());
        arch::context_switch(self.ctx.get(), ret.ctx.get());
    }

    /// The fiber that `yield` restores and `resume` saves into.
    fn return_fiber(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            scheduler::scheduling_fiber()
                .expect("scheduled fiber switched on a thread without a scheduling fiber")
        } else {
            THREAD_FIBER
                .with(|c| c.borrow().clone())
                .expect("fiber switched before the thread main fiber exists")
        }
    }

    /// Rebind a terminated fiber to a new callback, reusing its stack.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = self
            .stack
            .as_ref()
            .expect("reset on a stackless main fiber");
        assert_eq!(
            self.state(),
            State::Term,
            "fiber {} reset before terminating",
            self.id
        );
        let stack_top = (stack.as_ptr() as usize + self.stack_size) & !0xF;
        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            *self.ctx.get() = Context::new(stack_top, fiber_entry as usize, self as *const Fiber as u64);
        }
        self.set_state(State::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.stack.is_some() {
            // Dropping a live coroutine would unwind nothing and leak the
            // suspended frame; it must have finished.
            assert_eq!(
                self.state(),
                State::Term,
                "fiber {} dropped while {:?}",
                self.id,
                self.state()
            );
        } else {
            debug_assert!(unsafe { (*self.cb.get()).is_none() });
            assert_eq!(self.state(), State::Running);
        }
        log::debug!("fiber {} dropped", self.id);
    }
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// Entry trampoline for every stack-bearing fiber. `fiber` arrives in the
/// first-argument register, planted there by the context switch.
///
/// Runs on the fiber's own stack. Holds a shared handle to itself so the
/// fiber outlives its callback even if every external handle is dropped
/// mid-run. Panics escaping the callback are a contract violation and are
/// not caught.
extern "C" fn fiber_entry(fiber: *const Fiber) {
    let cur = Fiber::current();
    assert!(
        std::ptr::eq(Arc::as_ptr(&cur), fiber),
        "trampoline entered with a stale current fiber"
    );

    let cb = unsafe { (*cur.cb.get()).take() }.expect("fiber entered without a callback");
    cb();

    cur.set_state(State::Term);
    let raw_ptr = Arc::as_ptr(&cur);
    drop(cur);
    // The queue/current-task handles keep the fiber alive across this switch.
    unsafe { (*raw_ptr).yield_inner() };
    unreachable!("terminated fiber resumed");
}
