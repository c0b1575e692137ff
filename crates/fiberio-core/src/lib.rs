//! # fiberio-core
//!
//! Core types shared by the fiberio runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, epoll, timers and the hook layer live in
//! `fiberio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `event` - I/O interest mask (READ / WRITE)
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use event::Event;
pub use error::{RuntimeError, RuntimeResult};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_ms};

/// Constants shared across the runtime
pub mod constants {
    /// Guard page below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Sentinel for "no timeout configured" on a descriptor
    pub const NO_TIMEOUT: u64 = u64::MAX;

    /// Worker index of a thread that does not belong to any scheduler
    pub const NO_WORKER: usize = usize::MAX;
}
