//! M:N Stackful Coroutine Runtime
//!
//! A fixed pool of worker threads multiplexes many fibers, each with its own
//! stack and saved registers. Fibers yield cooperatively; an edge-triggered
//! epoll reactor and a timer set resume them when fds become ready or
//! deadlines expire. The [`hook`] module swaps blocking POSIX I/O for
//! fiber-suspending equivalents.
//!
//! # Example
//!
//! ```no_run
//! use spindle::{IoManager, hook};
//!
//! let iom = IoManager::new(2, false, "io").unwrap();
//!
//! iom.schedule_fn(|| {
//!     hook::set_hook_enable(true);
//!     // Suspends this fiber for a second; the worker keeps scheduling.
//!     hook::sleep(1);
//!     println!("awake");
//! });
//!
//! iom.stop();
//! ```
//!
//! Linux only: the reactor is built directly on epoll.

mod arch;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod timer;
pub mod util;

pub use fd::{FdCtx, FdManager, TimeoutKind, fd_manager};
pub use fiber::{Fiber, State};
pub use io::{Event, IoManager};
pub use scheduler::{ANY_THREAD, ScheduleTask, Scheduler};
pub use timer::{Timer, TimerCallback, TimerManager};
