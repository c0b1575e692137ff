//! I/O manager: a scheduler whose idle workers wait in epoll
//!
//! `IoManager` pairs a `Scheduler` with an `EpollReactor`. Workers run
//! with the hook layer enabled, so hooked calls in their fibers park on
//! descriptor readiness instead of blocking the thread.
//!
//! ```rust,ignore
//! let iom = IoManager::new(&runtime, 2, false, "io")?;
//! iom.submit(|| {
//!     fiberio_runtime::hook::sleep(1);
//! });
//! iom.stop();
//! ```

mod epoll;
mod tickle;

pub use epoll::{EpollReactor, FdEventContext};

use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use fiberio_core::{Event, RuntimeResult};

use crate::runtime::Runtime;
use crate::scheduler::{Callback, Scheduler};
use crate::signal;
use crate::timer::{TimerHandle, TimerManager};

/// Scheduler + epoll reactor + timers
///
/// The value returned by `new` owns the workers and stops them when
/// dropped; clones and `current()` handles do not.
pub struct IoManager {
    sched: Scheduler,
    reactor: Arc<EpollReactor>,
    owner: bool,
}

impl IoManager {
    /// Create and start an I/O manager with `threads` workers
    pub fn new(
        runtime: &Runtime,
        threads: usize,
        use_caller: bool,
        name: &str,
    ) -> RuntimeResult<IoManager> {
        signal::ignore_sigpipe();
        let reactor = EpollReactor::new(runtime.config())?;
        let sched = Scheduler::with_reactor(runtime, threads, use_caller, name, reactor.clone());
        sched.start()?;
        Ok(IoManager { sched, reactor, owner: true })
    }

    /// I/O manager owning the calling thread
    pub fn current() -> Option<IoManager> {
        let sched = Scheduler::current()?;
        let reactor = Arc::clone(sched.reactor())
            .as_any()
            .downcast::<EpollReactor>()
            .ok()?;
        Some(IoManager { sched, reactor, owner: false })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn reactor(&self) -> &Arc<EpollReactor> {
        &self.reactor
    }

    /// Wait for `event` on `fd`.
    ///
    /// With `cb` the callback is queued as a job once the event fires.
    /// Without, the calling fiber is resumed and should `yield_to_hold`
    /// right after registering.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> RuntimeResult<()> {
        self.reactor.add_event(fd, event, cb, &self.sched)
    }

    pub fn delete_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.delete_event(fd, event)
    }

    pub fn trigger_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.trigger_event(fd, event)
    }

    pub fn trigger_all(&self, fd: RawFd) -> bool {
        self.reactor.trigger_all(fd)
    }

    /// Registered (fd, direction) pairs
    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    pub fn timers(&self) -> &TimerManager {
        self.reactor.timers()
    }

    pub fn add_timer<F>(&self, delay_ms: u64, f: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers().add_timer(delay_ms, f, recurring)
    }

    pub fn add_condition_timer<F, W>(
        &self,
        delay_ms: u64,
        f: F,
        cond: Weak<W>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.reactor.timers().add_condition_timer(delay_ms, f, cond, recurring)
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Clone for IoManager {
    fn clone(&self) -> Self {
        IoManager {
            sched: self.sched.clone(),
            reactor: Arc::clone(&self.reactor),
            owner: false,
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if self.owner {
            self.sched.stop();
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched)
            .field("pending_events", &self.pending_events())
            .field("timers", &self.timers().len())
            .finish()
    }
}
