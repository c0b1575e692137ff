//! Explicit runtime context
//!
//! A `Runtime` owns what would otherwise be process-wide state: the
//! configuration, fiber id allocation and live count, the fd table and the
//! implementation of the real system calls. Schedulers, fibers and the
//! hook layer all reach it through a cheap clone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fiberio_core::kprint::{self, LogLevel};
use fiberio_core::FiberId;

use crate::config::{ConfigError, RuntimeConfig};
use crate::fd::FdManager;
use crate::hook::sys::{LibcSyscalls, RealSyscalls};

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    next_fiber_id: AtomicU64,
    live_fibers: AtomicU64,
    fds: FdManager,
    sys: Arc<dyn RealSyscalls>,
}

impl Runtime {
    /// Runtime using the libc system calls
    pub fn new(config: RuntimeConfig) -> Result<Runtime, ConfigError> {
        Self::with_syscalls(config, Arc::new(LibcSyscalls::new()))
    }

    /// Runtime configured from `FIO_*` variables
    pub fn from_env() -> Result<Runtime, ConfigError> {
        Self::new(RuntimeConfig::from_env())
    }

    /// Runtime with a custom system call layer (tests use a mock)
    pub fn with_syscalls(
        config: RuntimeConfig,
        sys: Arc<dyn RealSyscalls>,
    ) -> Result<Runtime, ConfigError> {
        config.validate()?;
        if config.debug && kprint::log_level() < LogLevel::Debug {
            kprint::set_log_level(LogLevel::Debug);
        }
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                fds: FdManager::new(Arc::clone(&sys)),
                config,
                next_fiber_id: AtomicU64::new(1),
                live_fibers: AtomicU64::new(0),
                sys,
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[inline]
    pub fn fds(&self) -> &FdManager {
        &self.inner.fds
    }

    #[inline]
    pub fn sys(&self) -> &dyn RealSyscalls {
        &*self.inner.sys
    }

    /// Fibers created by this runtime and not yet dropped
    #[inline]
    pub fn live_fibers(&self) -> u64 {
        self.inner.live_fibers.load(Ordering::Relaxed)
    }

    pub(crate) fn register_fiber(&self) -> FiberId {
        self.inner.live_fibers.fetch_add(1, Ordering::Relaxed);
        FiberId::new(self.inner.next_fiber_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn unregister_fiber(&self) {
        self.inner.live_fibers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Same underlying context
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("live_fibers", &self.live_fibers())
            .field("stack_size", &self.inner.config.stack_size)
            .finish()
    }
}
