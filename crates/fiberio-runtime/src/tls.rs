//! Thread-local state of the runtime
//!
//! A fiber can be suspended on one OS thread and resumed on another. The
//! accessors here are `#[inline(never)]` so that code running in a fiber
//! re-reads the thread-local slot after every switch instead of reusing an
//! address computed on the previous thread.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use fiberio_core::constants::NO_WORKER;

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

thread_local! {
    /// Fiber executing on this thread; null until the root is created
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Implicit fiber representing the thread's own stack
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber running the scheduler loop, target of `swap_out`
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Scheduler owning this thread
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };

    /// Hook layer switch
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };

    /// Worker index inside the owning scheduler
    static WORKER_ID: Cell<usize> = const { Cell::new(NO_WORKER) };
}

#[inline(never)]
pub fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.try_with(|c| c.get()).unwrap_or(std::ptr::null())
}

#[inline(never)]
pub fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

/// Root fiber of this thread, created on first use
#[inline(never)]
pub fn thread_root() -> *const Fiber {
    THREAD_ROOT.with(|root| {
        let mut root = root.borrow_mut();
        let fiber = root.get_or_insert_with(Fiber::new_root);
        Arc::as_ptr(fiber)
    })
}

#[inline(never)]
pub fn sched_fiber() -> *const Fiber {
    let p = SCHED_FIBER.with(|c| c.get());
    if p.is_null() {
        thread_root()
    } else {
        p
    }
}

#[inline(never)]
pub fn set_sched_fiber(fiber: *const Fiber) {
    SCHED_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub fn current_scheduler() -> Option<Scheduler> {
    SCHEDULER
        .try_with(|s| s.borrow().clone())
        .ok()
        .flatten()
}

#[inline(never)]
pub fn set_current_scheduler(sched: Option<Scheduler>) {
    SCHEDULER.with(|s| *s.borrow_mut() = sched);
}

#[inline(never)]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.try_with(|c| c.get()).unwrap_or(false)
}

#[inline(never)]
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

#[inline(never)]
pub fn worker_id() -> usize {
    WORKER_ID.try_with(|c| c.get()).unwrap_or(NO_WORKER)
}

#[inline(never)]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(id));
    fiberio_core::kprint::set_worker_id(id);
}

/// Worker index if this thread belongs to a scheduler
pub fn try_worker_id() -> Option<usize> {
    let id = worker_id();
    (id != NO_WORKER).then_some(id)
}
