//! # fiberio - cooperative fibers over epoll
//!
//! Stackful fibers multiplexed onto a small pool of OS threads. Code
//! running in a fiber calls blocking-style I/O through the hook layer;
//! when a call would block, the fiber is parked on the epoll reactor and
//! the worker thread moves on to other work.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fiberio::{IoManager, Runtime, RuntimeConfig};
//!
//! fn main() {
//!     let runtime = Runtime::new(RuntimeConfig::from_env()).unwrap();
//!     let iom = IoManager::new(&runtime, 2, false, "main").unwrap();
//!
//!     iom.submit(|| {
//!         fiberio::sleep_ms(100);
//!         println!("woke up in fiber {}", fiberio::current_id());
//!         fiberio::spawn(|| println!("child")).unwrap();
//!     });
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        User Code                             │
//! │        spawn(), yield_now(), sleep_ms(), hook::read()        │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Scheduler (job queue, workers)               │
//! └──────────────────────────────────────────────────────────────┘
//!                              │ idle
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │       IoManager: epoll_wait + TimerManager + tickle pipe     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use fiberio_core::{Event, FiberId, FiberState, RuntimeError, RuntimeResult};

// Re-export kprint macros for debug logging
pub use fiberio_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use fiberio_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use fiberio_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export runtime types
pub use fiberio_runtime::{
    Callback, ConfigError, EpollReactor, FdContext, FdManager, Fiber, IoManager, Job,
    ParkingReactor, Reactor, Runtime, RuntimeConfig, Scheduler, Task, TimeoutKind,
    TimerCallback, TimerHandle, TimerManager, WeakScheduler,
};
pub use fiberio_runtime::hook;

/// Run `f` as a job on the scheduler of the calling worker
///
/// Fails with `NotInScheduler` when called from a thread that does not
/// belong to a scheduler.
pub fn spawn<F>(f: F) -> RuntimeResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let sched = Scheduler::current().ok_or(RuntimeError::NotInScheduler)?;
    sched.submit(f);
    Ok(())
}

/// Yield to the scheduler
///
/// The current fiber goes back to the job queue as READY. Outside a fiber
/// this yields the OS thread.
#[inline]
pub fn yield_now() {
    if is_in_fiber() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Sleep for `ms` milliseconds
///
/// Inside an `IoManager` worker only the calling fiber is suspended.
pub fn sleep_ms(ms: u64) {
    let req = libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
    };
    hook::nanosleep(&req, None);
}

/// Id of the running fiber, `FiberId::ROOT` outside fibers
#[inline]
pub fn current_id() -> FiberId {
    Fiber::current_id()
}

/// Check if currently executing within a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    !current_id().is_root()
}
