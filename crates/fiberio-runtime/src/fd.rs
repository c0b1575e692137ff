//! Per-descriptor bookkeeping
//!
//! The runtime forces every socket it learns about into `O_NONBLOCK` so a
//! hooked call can never block the OS thread. `FdContext` remembers that
//! it did so (`sys_nonblock`) separately from what the application asked
//! for (`user_nonblock`), which lets `fcntl`/`ioctl` keep reporting the
//! mode the application believes it set.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use fiberio_core::constants::NO_TIMEOUT;
use fiberio_core::kdebug;

use crate::hook::sys::{FcntlArg, RealSyscalls};

/// Direction of a per-fd timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`, applies to the read family
    Recv,
    /// `SO_SNDTIMEO`, applies to the write family and `connect`
    Send,
}

#[derive(Debug)]
pub struct FdContext {
    fd: RawFd,
    initialized: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdContext {
    /// Inspect `fd`; sockets are switched to non-blocking mode.
    pub fn init(fd: RawFd, sys: &dyn RealSyscalls) -> FdContext {
        let kind = sys.fstat_is_socket(fd);
        let is_socket = kind == Some(true);

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { sys.fcntl(fd, libc::F_GETFL, FcntlArg::None) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { sys.fcntl(fd, libc::F_SETFL, FcntlArg::Int(flags | libc::O_NONBLOCK)) };
            }
            sys_nonblock = true;
        }

        kdebug!("fd {} context: socket={} sys_nonblock={}", fd, is_socket, sys_nonblock);
        FdContext {
            fd,
            initialized: kind.is_some(),
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn timeout_slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }

    /// Timeout in ms, `None` when waits are unbounded
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = self.timeout_slot(kind).load(Ordering::Acquire);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        self.timeout_slot(kind)
            .store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }
}

/// Growable fd -> `FdContext` table
pub struct FdManager {
    sys: Arc<dyn RealSyscalls>,
    table: RwLock<Vec<Option<Arc<FdContext>>>>,
}

const INITIAL_SLOTS: usize = 64;

impl FdManager {
    pub fn new(sys: Arc<dyn RealSyscalls>) -> Self {
        FdManager {
            sys,
            table: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    /// Context of `fd`; with `auto_create` a missing one is created.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            match table.get(idx) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if idx >= table.len() {
            let grown = (idx + 1).max(table.len() * 3 / 2);
            table.resize(grown, None);
        }
        // Another thread may have won the race
        let ctx = table[idx].get_or_insert_with(|| Arc::new(FdContext::init(fd, &*self.sys)));
        Some(Arc::clone(ctx))
    }

    /// Forget `fd`; the next `get(fd, true)` re-inspects it.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = table.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn capacity(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::mock::MockSyscalls;

    #[test]
    fn test_socket_forced_nonblocking() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(7);
        let mgr = FdManager::new(mock.clone());

        let ctx = mgr.get(7, true).unwrap();
        assert!(ctx.is_initialized());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        assert_ne!(mock.flags(7) & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_plain_file_untouched() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_file(3);
        let mgr = FdManager::new(mock.clone());

        let ctx = mgr.get(3, true).unwrap();
        assert!(ctx.is_initialized());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        assert_eq!(mock.flags(3) & libc::O_NONBLOCK, 0);

        // fstat fails for unknown descriptors
        let ctx = mgr.get(11, true).unwrap();
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn test_lookup_and_growth() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(200);
        let mgr = FdManager::new(mock);

        assert!(mgr.get(-1, true).is_none());
        assert!(mgr.get(200, false).is_none());
        let a = mgr.get(200, true).unwrap();
        assert!(mgr.capacity() > 200);
        let b = mgr.get(200, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        mgr.remove(200);
        assert!(mgr.get(200, false).is_none());
        mgr.remove(10_000);
    }

    #[test]
    fn test_timeouts() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(5);
        let ctx = FdContext::init(5, &*mock);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        ctx.set_timeout(TimeoutKind::Recv, Some(250));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(250));
        assert_eq!(ctx.timeout(TimeoutKind::Send), None);
        ctx.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
    }
}
