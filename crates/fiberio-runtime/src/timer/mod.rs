//! Deadline-ordered timers
//!
//! ```text
//!   add_timer ──► TimerManager ── RwLock<BTreeMap<(deadline, id), Timer>>
//!                     │
//!                     ├─ next_timeout_ms()   ◄── reactor computes epoll timeout
//!                     ├─ collect_expired()   ──► callbacks submitted as jobs
//!                     └─ front hook          ──► reactor tickle when the
//!                                                earliest deadline moves up
//! ```
//!
//! Timers are ordered by `(deadline, id)`, so two timers never compare
//! equal. Callbacks are cloned out under the lock and run by the caller
//! after the lock is released.

mod entry;
mod manager;

pub use entry::{TimerCallback, TimerHandle};
pub use manager::TimerManager;

pub(crate) use entry::Timer;
