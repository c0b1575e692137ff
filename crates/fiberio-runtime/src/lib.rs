//! # fiberio-runtime
//!
//! Stackful fibers and the machinery that runs them on a pool of OS
//! threads.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly) and fiber stacks
//! - An M:N scheduler with pinned jobs and pluggable idle behavior
//! - Deadline-ordered timers, including condition timers
//! - An epoll reactor (`IoManager`) that parks fibers on fd readiness
//! - A hook layer that turns blocking libc calls into fiber suspensions
//!
//! ```text
//!   Runtime ── config, fd table, real syscalls, fiber ids
//!      │
//!      └── Scheduler ── JobQueue ──► worker threads ──► Fiber::swap_in
//!               │
//!               └── Reactor (idle) ── ParkingReactor | EpollReactor + TimerManager
//! ```

pub mod arch;
pub mod config;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod memory;
pub mod reactor;
pub mod runtime;
pub mod scheduler;
pub mod signal;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use fd::{FdContext, FdManager, TimeoutKind};
pub use fiber::{Fiber, FiberFn};
pub use reactor::{EpollReactor, FdEventContext, IoManager};
pub use runtime::Runtime;
pub use scheduler::{Callback, Job, ParkingReactor, Reactor, Scheduler, Task, WeakScheduler};
pub use timer::{TimerCallback, TimerHandle, TimerManager};

pub use fiberio_core::{Event, FiberId, FiberState, RuntimeError, RuntimeResult};
