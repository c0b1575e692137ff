//! Stackful fibers
//!
//! A `Fiber` owns a guarded stack and a saved register set. Resuming a
//! fiber (`swap_in` or `call`) saves the registers of whatever fiber is
//! running on the thread and records it as the resumed fiber's caller;
//! `swap_out` switches back to that caller. In a worker the caller is the
//! fiber running the scheduler loop, on a plain thread it is the thread
//! root, and a fiber may also resume another one directly.
//!
//! A suspended fiber may be resumed by a different OS thread than the one
//! it yielded on. `on_cpu` stays set until the yielding side has finished
//! saving the context, and a resumer spins on it before switching in.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use fiberio_core::{kerror, kprint, ktrace, kwarn};
use fiberio_core::{FiberId, FiberState, RuntimeError, RuntimeResult};

use crate::arch::{self, Context};
use crate::memory::Stack;
use crate::runtime::Runtime;
use crate::tls;

/// Body of a fiber
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    stack: Option<Stack>,
    callback: UnsafeCell<Option<FiberFn>>,
    use_caller: bool,
    on_cpu: AtomicBool,
    /// Fiber that resumed this one, target of `swap_out`
    caller: UnsafeCell<*const Fiber>,
    runtime: Option<Runtime>,
}

// `ctx`, `callback` and `caller` are only touched by the thread that holds
// `on_cpu` or by the owner while the fiber is not running.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Fiber with the runtime's default stack size
    pub fn new<F>(runtime: &Runtime, f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_options(runtime, f, None, false)
    }

    /// Fiber with an explicit stack size and return target.
    ///
    /// Stack mapping failure aborts the process.
    pub fn with_options<F>(
        runtime: &Runtime,
        f: F,
        stack_size: Option<usize>,
        use_caller: bool,
    ) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = stack_size.unwrap_or(runtime.config().stack_size);
        let fiber = Arc::new(Fiber {
            id: runtime.register_fiber(),
            state: AtomicU8::new(FiberState::Init as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(Stack::new(size)),
            callback: UnsafeCell::new(Some(Box::new(f))),
            use_caller,
            on_cpu: AtomicBool::new(false),
            caller: UnsafeCell::new(std::ptr::null()),
            runtime: Some(runtime.clone()),
        });
        unsafe { fiber.init_context() };
        ktrace!("fiber {} created, stack {} bytes", fiber.id, size);
        fiber
    }

    /// Implicit fiber for a thread's own stack
    pub(crate) fn new_root() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: FiberId::ROOT,
            state: AtomicU8::new(FiberState::Exec as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            callback: UnsafeCell::new(None),
            use_caller: false,
            on_cpu: AtomicBool::new(false),
            caller: UnsafeCell::new(std::ptr::null()),
            runtime: None,
        })
    }

    unsafe fn init_context(&self) {
        if let Some(stack) = &self.stack {
            arch::init_context(self.ctx.get(), stack.top(), fiber_main, self as *const Fiber as usize);
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, next: FiberState) {
        debug_assert!(
            self.state().can_transition_to(next),
            "fiber {}: {} -> {}",
            self.id,
            self.state(),
            next
        );
        self.state.store(next as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    #[inline]
    pub fn use_caller(&self) -> bool {
        self.use_caller
    }

    pub fn runtime(&self) -> Option<&Runtime> {
        self.runtime.as_ref()
    }

    /// Reuse the stack for a new body. Only INIT, TERM and EXCEPT fibers
    /// can be reset.
    pub fn reset<F>(&self, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f))
            .map_err(|_| RuntimeError::InvalidState(self.state()))
    }

    pub(crate) fn reset_boxed(&self, f: FiberFn) -> Result<(), FiberFn> {
        if self.is_root() || !self.state().can_reset() || self.on_cpu.load(Ordering::Acquire) {
            return Err(f);
        }
        unsafe {
            *self.callback.get() = Some(f);
            self.init_context();
        }
        self.set_state(FiberState::Init);
        Ok(())
    }

    /// Switch from the running fiber (the scheduler loop in a worker)
    /// into this one.
    ///
    /// Returns the state the fiber left in once it switches back. A
    /// finished fiber, a thread root, or a fiber that is itself waiting in
    /// a resume of the running one is not entered; its state is returned.
    /// A fiber still switching out on another thread is waited for.
    pub fn swap_in(&self) -> FiberState {
        self.resume()
    }

    /// Switch into this one from a thread root or from another fiber
    pub fn call(&self) -> FiberState {
        self.resume()
    }

    fn resume(&self) -> FiberState {
        let mut from = tls::current_fiber_ptr();
        if from.is_null() {
            from = tls::thread_root();
            tls::set_current_fiber(from);
        }
        if self.is_root() || self.is_resuming(from) {
            return self.state();
        }

        // The previous thread may still be saving our registers
        while self
            .on_cpu
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let prev = self.state();
        if !prev.is_resumable() {
            self.on_cpu.store(false, Ordering::Release);
            return prev;
        }
        self.set_state(FiberState::Exec);

        let from_ref = unsafe { &*from };
        unsafe { *self.caller.get() = from };
        tls::set_current_fiber(self);
        kprint::set_fiber_id(self.id.as_u64());
        ktrace!("switch {} -> {}", from_ref.id, self.id);

        unsafe { arch::switch_context(from_ref.ctx.get(), self.ctx.get()) };

        tls::set_current_fiber(from);
        kprint::set_fiber_id(from_ref.id.as_u64());
        unsafe { *self.caller.get() = std::ptr::null() };
        let state = self.state();
        self.on_cpu.store(false, Ordering::Release);
        state
    }

    /// Whether this fiber is `from` or one of the fibers blocked in a
    /// resume below it. Those keep `on_cpu` set until `from` switches back.
    fn is_resuming(&self, from: *const Fiber) -> bool {
        let mut p = from;
        while !p.is_null() {
            if std::ptr::eq(p, self) {
                return true;
            }
            p = unsafe { *(*p).caller.get() };
        }
        false
    }

    /// Switch back to whoever resumed this fiber
    pub fn swap_out(&self) {
        let mut target = unsafe { *self.caller.get() };
        if target.is_null() {
            target = if self.use_caller {
                tls::thread_root()
            } else {
                tls::sched_fiber()
            };
        }
        if std::ptr::eq(target, self) || !std::ptr::eq(tls::current_fiber_ptr(), self) {
            return;
        }
        unsafe { arch::switch_context(self.ctx.get(), (*target).ctx.get()) };
    }

    /// Suspend the current fiber as READY; its scheduler requeues it
    pub fn yield_to_ready() {
        Self::yield_current(FiberState::Ready);
    }

    /// Suspend the current fiber as HOLD; someone must resubmit it
    pub fn yield_to_hold() {
        Self::yield_current(FiberState::Hold);
    }

    fn yield_current(state: FiberState) {
        let cur = tls::current_fiber_ptr();
        if cur.is_null() {
            return;
        }
        let cur = unsafe { &*cur };
        if cur.is_root() {
            kwarn!("yield to {} from a thread root ignored", state);
            return;
        }
        cur.set_state(state);
        cur.swap_out();
    }

    /// Fiber running on this thread, creating the thread root on first use
    pub fn current() -> Arc<Fiber> {
        let mut p = tls::current_fiber_ptr();
        if p.is_null() {
            p = tls::thread_root();
            tls::set_current_fiber(p);
        }
        // Whoever resumed the current fiber holds a strong reference
        unsafe {
            Arc::increment_strong_count(p);
            Arc::from_raw(p)
        }
    }

    /// Id of the running fiber, `FiberId::ROOT` outside fibers
    pub fn current_id() -> FiberId {
        let p = tls::current_fiber_ptr();
        if p.is_null() {
            FiberId::ROOT
        } else {
            unsafe { (*p).id }
        }
    }

    /// Live fibers of `runtime`
    pub fn total_count(runtime: &Runtime) -> u64 {
        runtime.live_fibers()
    }
}

extern "C" fn fiber_main(arg: usize) -> ! {
    let fiber = unsafe { &*(arg as *const Fiber) };
    run_body(fiber);
    fiber.swap_out();

    kerror!("fiber {} resumed after it finished", fiber.id);
    std::process::abort();
}

// Everything owned here is dropped before the final switch.
fn run_body(fiber: &Fiber) {
    let body = unsafe { (*fiber.callback.get()).take() };
    let result = match body {
        Some(body) => panic::catch_unwind(AssertUnwindSafe(body)),
        None => Ok(()),
    };
    match result {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            kerror!("fiber {} panicked: {}", fiber.id, panic_message(&*payload));
            fiber.set_state(FiberState::Except);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(rt) = &self.runtime {
            rt.unregister_fiber();
            let state = self.state();
            if matches!(state, FiberState::Ready | FiberState::Hold) {
                kwarn!("fiber {} dropped while suspended ({})", self.id, state);
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("use_caller", &self.use_caller)
            .finish()
    }
}
