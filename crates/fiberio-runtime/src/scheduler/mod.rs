//! N-thread cooperative scheduler
//!
//! ```text
//!   submit / submit_to / schedule ──► JobQueue ──► worker run loop
//!                                        │            │ swap_in(job fiber)
//!                                        │            ▼
//!                                        │        idle fiber ──► Reactor::idle
//!                                        └──── tickle ◄────────────┘
//! ```
//!
//! Each worker is an OS thread running `run`. Callback jobs execute on a
//! pooled fiber that is reset and reused once the previous callback
//! finished. When nothing is queued the worker switches into its idle
//! fiber, which hands control to the reactor until work or a stop request
//! arrives.
//!
//! With `use_caller` the constructing thread also becomes a worker (index
//! `thread_count`): `stop` runs the loop on it inside a dedicated root
//! fiber until the scheduler drains.

mod idle;
mod queue;

pub use idle::{ParkingReactor, Reactor};
pub use queue::{Callback, Job, Task};

pub(crate) use queue::JobQueue;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use fiberio_core::constants::NO_WORKER;
use fiberio_core::{kdebug, kerror, kinfo, kwarn};
use fiberio_core::{FiberState, RuntimeError, RuntimeResult};

use crate::fiber::Fiber;
use crate::runtime::Runtime;
use crate::tls;

struct SchedulerInner {
    name: String,
    runtime: Runtime,
    queue: JobQueue,
    reactor: Arc<dyn Reactor>,
    thread_count: usize,
    use_caller: bool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Loop fiber of the caller worker, consumed by `stop`
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    idle_count: AtomicUsize,
}

/// Handle to a scheduler; clones share the same workers
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Non-owning handle, for callbacks that must not keep a scheduler alive
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<SchedulerInner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl Scheduler {
    /// Scheduler whose idle workers park
    pub fn new(runtime: &Runtime, threads: usize, use_caller: bool, name: &str) -> Scheduler {
        let reactor = Arc::new(ParkingReactor::new(runtime.config().park_timeout));
        Self::with_reactor(runtime, threads, use_caller, name, reactor)
    }

    /// Scheduler driven by a custom `reactor`.
    ///
    /// `threads` OS threads are spawned by `start`; with `use_caller` the
    /// calling thread is one more worker.
    pub fn with_reactor(
        runtime: &Runtime,
        threads: usize,
        use_caller: bool,
        name: &str,
        reactor: Arc<dyn Reactor>,
    ) -> Scheduler {
        let threads = if threads == 0 && !use_caller {
            kwarn!("scheduler {}: no workers requested, using one thread", name);
            1
        } else {
            threads
        };
        let workers = threads + use_caller as usize;

        let sched = Scheduler {
            inner: Arc::new(SchedulerInner {
                name: name.to_string(),
                runtime: runtime.clone(),
                queue: JobQueue::new(workers),
                reactor,
                thread_count: threads,
                use_caller,
                threads: Mutex::new(Vec::with_capacity(threads)),
                root_fiber: Mutex::new(None),
                started: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                idle_count: AtomicUsize::new(0),
            }),
        };

        if use_caller {
            let weak = sched.downgrade();
            let root = Fiber::with_options(
                runtime,
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run(threads);
                    }
                },
                None,
                true,
            );
            *sched.inner.root_fiber.lock().unwrap_or_else(|e| e.into_inner()) = Some(root);
            tls::set_current_scheduler(Some(sched.clone()));
        }
        sched
    }

    /// Spawn the worker threads, named `{name}-{i}`
    pub fn start(&self) -> RuntimeResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }

        let mut threads = inner.threads.lock().unwrap_or_else(|e| e.into_inner());
        for i in 0..inner.thread_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", inner.name, i))
                .spawn(move || sched.run(i))
                .map_err(|e| {
                    kerror!("scheduler {}: spawning worker {} failed: {}", inner.name, i, e);
                    RuntimeError::SpawnFailed
                })?;
            threads.push(handle);
        }

        kinfo!(
            "scheduler {} started: {} threads{}",
            inner.name,
            inner.thread_count,
            if inner.use_caller { " + caller" } else { "" }
        );
        Ok(())
    }

    /// Request a stop and wait until every job, waiter and timer is done.
    ///
    /// With `use_caller` the calling thread runs the loop until the
    /// scheduler drains. From inside one of this scheduler's own workers
    /// the request is recorded but not waited for.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.stop_requested.store(true, Ordering::SeqCst);
        inner.reactor.tickle_all();

        if self.is_current() && tls::try_worker_id().is_some() {
            kwarn!("scheduler {}: stop() from a worker, not waiting", inner.name);
            return;
        }

        let root = inner.root_fiber.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(root) = root {
            let state = root.call();
            if state != FiberState::Term {
                kwarn!("scheduler {}: caller loop left in {}", inner.name, state);
            }
        }

        let handles = std::mem::take(&mut *inner.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                kerror!("worker {} panicked", name);
            }
        }

        if self.is_current() {
            tls::set_current_scheduler(None);
        }
        kinfo!("scheduler {} stopped", inner.name);
    }

    /// Stop requested, nothing queued or running, reactor quiescent
    pub fn stopping(&self) -> bool {
        let inner = &self.inner;
        inner.stop_requested.load(Ordering::SeqCst)
            && inner.queue.is_drained()
            && inner.reactor.is_quiescent()
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Run `f` on a pooled fiber
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Job::call(f));
    }

    /// Run `f` only on worker `worker`
    pub fn submit_to<F>(&self, f: F, worker: usize)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Job::call(f).pinned(Some(worker)));
    }

    /// Resume `fiber`, optionally on a given worker
    pub fn submit_fiber(&self, fiber: Arc<Fiber>, worker: Option<usize>) {
        self.schedule(Job::fiber(fiber).pinned(worker));
    }

    pub fn schedule(&self, job: Job) {
        let inner = &self.inner;
        match inner.queue.push(job) {
            Some(w) => {
                // Only the target worker may take it
                if !(self.is_current() && tls::worker_id() == w) {
                    inner.reactor.tickle_all();
                }
            }
            None => {
                if self.has_idle_threads() {
                    inner.reactor.tickle();
                }
            }
        }
    }

    /// Scheduler owning the calling thread
    pub fn current() -> Option<Scheduler> {
        tls::current_scheduler()
    }

    pub fn is_current(&self) -> bool {
        tls::current_scheduler().is_some_and(|s| s.ptr_eq(self))
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.inner.idle_count.load(Ordering::SeqCst) > 0
    }

    /// Jobs are queued
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.inner.queue.len() > 0
    }

    /// Spawned threads plus the caller worker
    pub fn worker_count(&self) -> usize {
        self.inner.thread_count + self.inner.use_caller as usize
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub(crate) fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.inner.reactor
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler { inner: Arc::downgrade(&self.inner) }
    }

    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn run(&self, worker: usize) {
        let inner = &self.inner;
        tls::set_worker_id(worker);
        tls::set_current_scheduler(Some(self.clone()));
        tls::set_hook_enabled(inner.reactor.hooks_enabled());

        let loop_fiber = Fiber::current();
        tls::set_sched_fiber(Arc::as_ptr(&loop_fiber));
        kdebug!("scheduler {} worker {} running", inner.name, worker);

        let sched = self.clone();
        let idle = Fiber::new(&inner.runtime, move || sched.idle_loop());
        let mut pooled: Option<Arc<Fiber>> = None;

        loop {
            let Some(Job { task, worker: pin }) = inner.queue.pop(worker) else {
                if idle.state().is_terminal() {
                    break;
                }
                inner.idle_count.fetch_add(1, Ordering::SeqCst);
                idle.swap_in();
                inner.idle_count.fetch_sub(1, Ordering::SeqCst);
                continue;
            };

            if inner.queue.len() > 0 && self.has_idle_threads() {
                inner.reactor.tickle();
            }

            let (fiber, state, poolable) = match task {
                Task::Fiber(fiber) => {
                    let state = fiber.swap_in();
                    (fiber, state, false)
                }
                Task::Call(f) => {
                    let fiber = match pooled.take() {
                        Some(fiber) => match fiber.reset_boxed(f) {
                            Ok(()) => fiber,
                            Err(f) => Fiber::new(&inner.runtime, f),
                        },
                        None => Fiber::new(&inner.runtime, f),
                    };
                    let state = fiber.swap_in();
                    (fiber, state, true)
                }
            };

            match state {
                FiberState::Ready => self.schedule(Job::fiber(fiber).pinned(pin)),
                FiberState::Term | FiberState::Except if poolable => pooled = Some(fiber),
                // HOLD: whoever resumes it holds a reference
                _ => {}
            }
            inner.queue.finish();
        }

        kdebug!("scheduler {} worker {} exiting", inner.name, worker);
        inner.reactor.tickle_all();
        drop(pooled);
        drop(idle);
        tls::set_hook_enabled(false);
        tls::set_sched_fiber(std::ptr::null());
        tls::set_worker_id(NO_WORKER);
        if !inner.use_caller || worker != inner.thread_count {
            tls::set_current_scheduler(None);
        }
    }

    fn idle_loop(&self) {
        while !self.stopping() {
            let may_block = !self.has_pending();
            self.inner.reactor.idle(self, may_block);
            Fiber::yield_to_hold();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("threads", &self.inner.thread_count)
            .field("use_caller", &self.inner.use_caller)
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().park_timeout(Duration::from_millis(20))).unwrap()
    }

    #[test]
    fn test_jobs_run_once_before_stop() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 2, false, "once");
        sched.start().unwrap();

        let hits = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
        for i in 0..2 {
            let h = Arc::clone(&hits);
            sched.submit(move || {
                h[i].fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();

        assert_eq!(hits[0].load(Ordering::SeqCst), 1);
        assert_eq!(hits[1].load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_twice() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 1, false, "twice");
        sched.start().unwrap();
        assert_eq!(sched.start(), Err(RuntimeError::AlreadyStarted));
        sched.stop();
    }

    #[test]
    fn test_yield_interleaves_on_one_worker() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 1, false, "yield");
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let log = Arc::clone(&log);
            sched.submit(move || {
                for i in 0..2 {
                    log.lock().unwrap().push(format!("{name}{i}"));
                    Fiber::yield_to_ready();
                }
            });
        }
        sched.start().unwrap();
        sched.stop();
        assert_eq!(*log.lock().unwrap(), vec!["a0", "b0", "a1", "b1"]);
    }

    #[test]
    fn test_use_caller_runs_on_stop() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 0, true, "caller");
        assert_eq!(sched.worker_count(), 1);
        assert!(Scheduler::current().unwrap().ptr_eq(&sched));
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        sched.submit(move || {
            tx.send((thread::current().id(), tls::worker_id())).unwrap();
        });
        sched.stop();

        let (tid, worker) = rx.try_recv().unwrap();
        assert_eq!(tid, thread::current().id());
        assert_eq!(worker, 0);
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_pinned_job_stays_on_worker() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 3, false, "pin");
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            sched.submit_to(
                move || {
                    tx.send(tls::worker_id()).unwrap();
                    Fiber::yield_to_ready();
                    tx.send(tls::worker_id()).unwrap();
                },
                1,
            );
        }
        drop(tx);
        sched.stop();
        let seen: Vec<usize> = rx.iter().collect();
        assert_eq!(seen.len(), 16);
        assert!(seen.iter().all(|&w| w == 1), "{seen:?}");
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        // Unwinding and the panic hook need more than the default stack
        let rt = Runtime::new(
            RuntimeConfig::new()
                .park_timeout(Duration::from_millis(20))
                .stack_size(256 * 1024),
        )
        .unwrap();
        let sched = Scheduler::new(&rt, 1, false, "panic");
        sched.start().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        sched.submit(|| panic!("job failed"));
        let d = Arc::clone(&done);
        sched.submit(move || d.store(true, Ordering::SeqCst));
        sched.stop();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_current_inside_job() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 1, false, "cur");
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let expect = sched.clone();
        sched.submit(move || {
            let cur = Scheduler::current().unwrap();
            tx.send(cur.ptr_eq(&expect) && cur.name() == "cur").unwrap();
        });
        sched.stop();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_held_fiber_resubmitted() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 2, false, "hold");
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let s = sched.clone();
        sched.submit(move || {
            let me = Fiber::current();
            let s2 = s.clone();
            // Resubmit from another job once we are suspended
            s.submit(move || s2.submit_fiber(me, None));
            Fiber::yield_to_hold();
            tx.send(Fiber::current_id()).unwrap();
        });
        let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!id.is_root());
        sched.stop();
    }

    #[test]
    fn test_job_resumes_own_fiber() {
        let rt = runtime();
        let sched = Scheduler::new(&rt, 1, false, "nested");
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let rt2 = rt.clone();
        sched.submit(move || {
            let hits = Arc::new(AtomicUsize::new(0));
            let h = Arc::clone(&hits);
            let inner = Fiber::new(&rt2, move || {
                h.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                h.fetch_add(1, Ordering::SeqCst);
            });
            let first = inner.call();
            Fiber::yield_to_ready();
            let second = inner.swap_in();
            tx.send((first, second, hits.load(Ordering::SeqCst))).unwrap();
        });
        sched.submit(|| {});

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, (FiberState::Hold, FiberState::Term, 2));
        sched.stop();
    }
}
