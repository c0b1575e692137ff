//! What a worker does when its queue is empty
//!
//! A `Reactor` owns the idle wait and the matching wake-up ("tickle").
//! The default `ParkingReactor` parks idle workers on a futex (Linux) or
//! a condvar; the I/O manager plugs in an epoll reactor instead.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use fiberio_core::ktrace;

use super::Scheduler;

/// Idle strategy plugged into a `Scheduler`
pub trait Reactor: Send + Sync + 'static {
    /// One idle pass on a worker.
    ///
    /// `may_block` is false when jobs are already queued; the reactor
    /// should then only poll.
    fn idle(&self, sched: &Scheduler, may_block: bool);

    /// Wake one idle worker
    fn tickle(&self);

    /// Wake every idle worker
    fn tickle_all(&self) {
        self.tickle();
    }

    /// No waiters or timers that would still produce jobs
    fn is_quiescent(&self) -> bool {
        true
    }

    /// Workers of this scheduler run with the hook layer on
    fn hooks_enabled(&self) -> bool {
        false
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Parks idle workers; no I/O
pub struct ParkingReactor {
    parker: Parker,
    timeout: Duration,
}

impl ParkingReactor {
    /// `timeout` bounds one park so stop requests are noticed
    pub fn new(timeout: Duration) -> Self {
        ParkingReactor { parker: Parker::new(), timeout }
    }

    /// Workers currently parked (hint)
    pub fn parked_count(&self) -> usize {
        self.parker.parked_count()
    }
}

impl Reactor for ParkingReactor {
    fn idle(&self, sched: &Scheduler, may_block: bool) {
        if !may_block {
            return;
        }
        let woken = self.parker.park(self.timeout, || sched.has_pending());
        ktrace!("park returned, woken={}", woken);
    }

    fn tickle(&self) {
        self.parker.wake(1);
    }

    fn tickle_all(&self) {
        self.parker.wake(i32::MAX);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

        /// Futex word: 0 = sleep, 1 = wake pending
        struct Parker {
            word: AtomicU32,
            parked: AtomicUsize,
        }

        impl Parker {
            fn new() -> Self {
                Parker { word: AtomicU32::new(0), parked: AtomicUsize::new(0) }
            }

            /// Sleep until woken or `timeout`. `ready` is checked after
            /// announcing the park, so a waker that saw no parked worker
            /// has already made `ready` true.
            fn park(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
                self.parked.fetch_add(1, Ordering::SeqCst);
                if self.word.swap(0, Ordering::AcqRel) != 0 || ready() {
                    self.parked.fetch_sub(1, Ordering::SeqCst);
                    return true;
                }

                let ts = libc::timespec {
                    tv_sec: timeout.as_secs() as libc::time_t,
                    tv_nsec: timeout.subsec_nanos() as libc::c_long,
                };
                let rc = unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.word.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        0u32,
                        &ts as *const libc::timespec,
                        std::ptr::null::<u32>(),
                        0u32,
                    )
                };
                self.parked.fetch_sub(1, Ordering::SeqCst);
                // ETIMEDOUT, EAGAIN (word changed) and EINTR all count as not woken
                rc == 0
            }

            fn wake(&self, n: i32) {
                if self.parked.load(Ordering::SeqCst) == 0 {
                    return;
                }
                self.word.store(1, Ordering::Release);
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.word.as_ptr(),
                        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                        n,
                        std::ptr::null::<libc::timespec>(),
                        std::ptr::null::<u32>(),
                        0u32,
                    );
                }
            }

            fn parked_count(&self) -> usize {
                self.parked.load(Ordering::Relaxed)
            }
        }
    } else {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Condvar, Mutex};

        /// Condvar fallback; the bool is "wake pending"
        struct Parker {
            pending: Mutex<bool>,
            cond: Condvar,
            parked: AtomicUsize,
        }

        impl Parker {
            fn new() -> Self {
                Parker {
                    pending: Mutex::new(false),
                    cond: Condvar::new(),
                    parked: AtomicUsize::new(0),
                }
            }

            fn park(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
                self.parked.fetch_add(1, Ordering::SeqCst);
                let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                if std::mem::take(&mut *guard) || ready() {
                    self.parked.fetch_sub(1, Ordering::SeqCst);
                    return true;
                }
                let (mut guard, result) = self
                    .cond
                    .wait_timeout(guard, timeout)
                    .unwrap_or_else(|e| e.into_inner());
                *guard = false;
                self.parked.fetch_sub(1, Ordering::SeqCst);
                !result.timed_out()
            }

            fn wake(&self, n: i32) {
                if self.parked.load(Ordering::SeqCst) == 0 {
                    return;
                }
                *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = true;
                if n == 1 {
                    self.cond.notify_one();
                } else {
                    self.cond.notify_all();
                }
            }

            fn parked_count(&self) -> usize {
                self.parked.load(Ordering::Relaxed)
            }
        }
    }
}
