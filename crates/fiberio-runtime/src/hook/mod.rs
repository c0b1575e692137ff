//! Fiber-aware versions of blocking libc calls
//!
//! Inside an `IoManager` worker (where the hook flag is on) these calls
//! look blocking to the calling fiber but never block the OS thread:
//!
//! ```text
//!   read(fd) ──► real read ──► EAGAIN ──► add_event(fd, READ) + timeout timer
//!                    ▲                           │ yield_to_hold
//!                    └──── retry ◄── resumed by epoll / timer / close
//! ```
//!
//! Everywhere else, and for descriptors that are not sockets or that the
//! application put in non-blocking mode itself, they forward to the real
//! call. Return values and errno follow the libc contract.

#[cfg(feature = "interpose")]
mod interpose;
#[cfg(test)]
pub(crate) mod mock;
pub mod sys;

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use libc::{c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t};

use fiberio_core::{kdebug, ktrace, kwarn};
use fiberio_core::{Event, RuntimeError};

use crate::fd::{FdContext, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::IoManager;
use crate::scheduler::Scheduler;
use crate::tls;

use self::sys::{errno, set_errno, FcntlArg, LibcSyscalls, RealSyscalls};

static LIBC: LibcSyscalls = LibcSyscalls::new();

/// Hook flag of the calling thread
pub fn is_enabled() -> bool {
    tls::hook_enabled()
}

pub fn set_enabled(on: bool) {
    tls::set_hook_enabled(on);
}

/// I/O manager to park on, when hooking applies to this thread
fn io_manager() -> Option<IoManager> {
    if !is_enabled() {
        return None;
    }
    IoManager::current()
}

/// Run `f` against the system calls of the thread's runtime, or libc
fn real<R>(f: impl FnOnce(&dyn RealSyscalls) -> R) -> R {
    match Scheduler::current() {
        Some(sched) => f(sched.runtime().sys()),
        None => f(&LIBC),
    }
}

/// Context of a socket known to the thread's runtime
fn socket_context(fd: RawFd) -> Option<(Scheduler, Arc<FdContext>)> {
    let sched = Scheduler::current()?;
    let ctx = sched.runtime().fds().get(fd, false)?;
    if ctx.is_closed() || !ctx.is_socket() {
        return None;
    }
    Some((sched, ctx))
}

fn errno_of(e: &RuntimeError) -> c_int {
    match e {
        RuntimeError::EventExists { .. } => libc::EEXIST,
        RuntimeError::NotInScheduler => libc::EPERM,
        other => other.errno().unwrap_or(libc::EINVAL),
    }
}

const WAITING: c_int = 0;
const RESUMED: c_int = -1;

/// Outcome of one wait, shared with its timeout timer
struct WaitState {
    /// WAITING, RESUMED, or the errno set by the timer
    status: AtomicI32,
}

/// Park the current fiber until `event` on `fd`, a timeout or a close.
///
/// Err carries the errno to report.
fn wait_ready(iom: &IoManager, fd: RawFd, event: Event, timeout_ms: Option<u64>) -> Result<(), c_int> {
    if let Err(e) = iom.add_event(fd, event, None) {
        return Err(errno_of(&e));
    }

    // Armed after registration so a firing timer always finds the waiter
    let state = Arc::new(WaitState { status: AtomicI32::new(WAITING) });
    let timer = timeout_ms.map(|ms| {
        let weak_state = Arc::downgrade(&state);
        let reactor = Arc::downgrade(iom.reactor());
        iom.add_condition_timer(
            ms,
            move || {
                let Some(state) = weak_state.upgrade() else {
                    return;
                };
                if state
                    .status
                    .compare_exchange(WAITING, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if let Some(reactor) = reactor.upgrade() {
                        reactor.trigger_event(fd, event);
                    }
                }
            },
            Arc::downgrade(&state),
            false,
        )
    });

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match state
        .status
        .compare_exchange(WAITING, RESUMED, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Shared retry loop of the read and write families
pub(crate) fn do_io<F>(fd: RawFd, name: &'static str, event: Event, kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut(&dyn RealSyscalls) -> ssize_t,
{
    let Some(iom) = io_manager() else {
        return real(|sys| op(sys));
    };
    let runtime = iom.runtime().clone();
    let sys = runtime.sys();
    let Some(ctx) = runtime.fds().get(fd, false) else {
        return op(sys);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op(sys);
    }

    let timeout = ctx.timeout(kind);
    loop {
        let mut n = op(sys);
        while n == -1 && errno() == libc::EINTR {
            n = op(sys);
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        ktrace!("{}({}) would block, waiting for {}", name, fd, event);
        if let Err(e) = wait_ready(&iom, fd, event, timeout) {
            if e == libc::ETIMEDOUT {
                // Readiness may have won the wakeup just before the timer fired
                let n = op(sys);
                if n != -1 || !matches!(errno(), libc::EAGAIN | libc::EINTR) {
                    return n;
                }
            } else {
                kwarn!("{}({}): wait for {} failed, errno {}", name, fd, event, e);
            }
            set_errno(e);
            return -1;
        }
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

/// Suspend the current fiber for `ms`; false if the caller must really sleep
fn fiber_sleep(ms: u64) -> bool {
    let Some(iom) = io_manager() else {
        return false;
    };
    let fiber = Fiber::current();
    if fiber.is_root() {
        return false;
    }

    let sched = iom.scheduler().downgrade();
    let parked = Mutex::new(Some(fiber));
    iom.add_timer(
        ms,
        move || {
            let fiber = parked.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let (Some(fiber), Some(sched)) = (fiber, sched.upgrade()) {
                sched.submit_fiber(fiber, None);
            }
        },
        false,
    );
    Fiber::yield_to_hold();
    true
}

pub fn sleep(secs: c_uint) -> c_uint {
    if fiber_sleep(secs as u64 * 1000) {
        0
    } else {
        real(|sys| sys.sleep(secs))
    }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    if fiber_sleep(usec as u64 / 1000) {
        0
    } else {
        real(|sys| sys.usleep(usec))
    }
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> c_int {
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        set_errno(libc::EINVAL);
        return -1;
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    if fiber_sleep(ms) {
        if let Some(rem) = rem {
            rem.tv_sec = 0;
            rem.tv_nsec = 0;
        }
        return 0;
    }
    let rem = rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec);
    real(|sys| unsafe { sys.nanosleep(req, rem) })
}

/// `socket(2)`; sockets created inside an I/O manager are registered
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> RawFd {
    let fd = real(|sys| sys.socket(domain, ty, protocol));
    if fd >= 0 {
        if let Some(iom) = io_manager() {
            iom.runtime().fds().get(fd, true);
        }
    }
    fd
}

/// `connect(2)` bounded by the runtime's connect timeout
///
/// # Safety
///
/// `addr` must point to `len` valid bytes.
pub unsafe fn connect(fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int {
    let timeout = Scheduler::current()
        .and_then(|s| s.runtime().config().connect_timeout)
        .map(|d| d.as_millis() as u64);
    connect_with_timeout(fd, addr, len, timeout)
}

/// `connect(2)` with an explicit timeout; `None` waits forever
///
/// # Safety
///
/// `addr` must point to `len` valid bytes.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    let Some(iom) = io_manager() else {
        return real(|sys| sys.connect(fd, addr, len));
    };
    let runtime = iom.runtime().clone();
    let sys = runtime.sys();
    let Some(ctx) = runtime.fds().get(fd, false) else {
        return sys.connect(fd, addr, len);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return sys.connect(fd, addr, len);
    }

    let n = sys.connect(fd, addr, len);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    if let Err(e) = wait_ready(&iom, fd, Event::WRITE, timeout_ms) {
        set_errno(e);
        return -1;
    }
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = sys.getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    );
    if rc == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// `accept(2)`; the new descriptor is registered
///
/// # Safety
///
/// `addr`/`len` must be null or valid as for `accept(2)`.
pub unsafe fn accept(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> RawFd {
    let conn = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, |sys| {
        sys.accept(fd, addr, len) as ssize_t
    }) as RawFd;
    if conn >= 0 {
        if let Some(iom) = io_manager() {
            iom.runtime().fds().get(conn, true);
        }
    }
    conn
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, |sys| unsafe {
        sys.read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> ssize_t {
    // IoSliceMut is ABI compatible with iovec
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, |sys| unsafe {
        sys.readv(fd, bufs.as_mut_ptr() as *const iovec, bufs.len() as c_int)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, |sys| unsafe {
        sys.recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// Same pointer requirements as `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, |sys| {
        sys.recvfrom(fd, buf, len, flags, addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must be valid as for `recvmsg(2)`.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, |sys| sys.recvmsg(fd, msg, flags))
}

pub fn write(fd: RawFd, buf: &[u8]) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, |sys| unsafe {
        sys.write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> ssize_t {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, |sys| unsafe {
        sys.writev(fd, bufs.as_ptr() as *const iovec, bufs.len() as c_int)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, |sys| unsafe {
        sys.send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// Same pointer requirements as `sendto(2)`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, |sys| {
        sys.sendto(fd, buf, len, flags, addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must be valid as for `sendmsg(2)`.
pub unsafe fn sendmsg(fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, |sys| sys.sendmsg(fd, msg, flags))
}

/// Wake every fiber waiting on `fd`, forget its context, then close it
pub fn close(fd: RawFd) -> c_int {
    if let Some(iom) = io_manager() {
        let runtime = iom.runtime().clone();
        if let Some(ctx) = runtime.fds().get(fd, false) {
            ctx.mark_closed();
            if iom.trigger_all(fd) {
                kdebug!("close({}) woke pending waiters", fd);
            }
            runtime.fds().remove(fd);
        }
        return runtime.sys().close(fd);
    }
    real(|sys| sys.close(fd))
}

/// `fcntl(2)` keeping the application's view of `O_NONBLOCK`
///
/// # Safety
///
/// `arg` must be what `cmd` expects.
pub unsafe fn fcntl(fd: RawFd, cmd: c_int, arg: FcntlArg) -> c_int {
    match (cmd, arg) {
        (libc::F_SETFL, FcntlArg::Int(flags)) => {
            let Some((sched, ctx)) = socket_context(fd) else {
                return real(|sys| sys.fcntl(fd, cmd, arg));
            };
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            let flags = if ctx.sys_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            sched.runtime().sys().fcntl(fd, cmd, FcntlArg::Int(flags))
        }
        (libc::F_GETFL, _) => {
            let flags = real(|sys| sys.fcntl(fd, cmd, arg));
            if flags == -1 {
                return flags;
            }
            match socket_context(fd) {
                Some((_, ctx)) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => real(|sys| sys.fcntl(fd, cmd, arg)),
    }
}

/// `ioctl(2)`; `FIONBIO` only changes the application's view
///
/// # Safety
///
/// `arg` must be what `request` expects.
pub unsafe fn ioctl(fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as libc::Ioctl && !arg.is_null() {
        if let Some((sched, ctx)) = socket_context(fd) {
            let user = *(arg as *const c_int) != 0;
            ctx.set_user_nonblock(user);
            let mut on: c_int = ctx.sys_nonblock() as c_int;
            return sched
                .runtime()
                .sys()
                .ioctl(fd, request, &mut on as *mut c_int as *mut c_void);
        }
    }
    real(|sys| sys.ioctl(fd, request, arg))
}

/// # Safety
///
/// Same pointer requirements as `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    val: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    real(|sys| sys.getsockopt(fd, level, name, val, len))
}

/// `setsockopt(2)`; `SO_RCVTIMEO`/`SO_SNDTIMEO` also bound hooked waits
///
/// # Safety
///
/// Same pointer requirements as `setsockopt(2)`.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    val: *const c_void,
    len: socklen_t,
) -> c_int {
    let is_timeout = level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !val.is_null()
        && len as usize >= std::mem::size_of::<libc::timeval>();
    if is_timeout {
        if let Some((_, ctx)) = socket_context(fd) {
            let tv = &*(val as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if name == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, (ms > 0).then_some(ms));
        }
    }
    real(|sys| sys.setsockopt(fd, level, name, val, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::hook::mock::MockSyscalls;
    use crate::runtime::Runtime;
    use std::net::TcpListener;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().epoll_max_timeout(Duration::from_millis(200))).unwrap()
    }

    fn on_worker<T, F>(iom: &IoManager, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        iom.submit(move || tx.send(f()).unwrap());
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_sleeps_overlap_on_one_thread() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "sleep").unwrap();
        let (tx, rx) = mpsc::channel();

        let start = Instant::now();
        for secs in [2, 1] {
            let tx = tx.clone();
            iom.submit(move || {
                assert!(is_enabled());
                sleep(secs);
                tx.send(secs).unwrap();
            });
        }
        let order: Vec<u32> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        let elapsed = start.elapsed();

        assert_eq!(order, vec![1, 2]);
        assert!(elapsed >= Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2900), "{elapsed:?}");
        iom.stop();
    }

    #[test]
    fn test_usleep_and_nanosleep_yield() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "nap").unwrap();
        let elapsed = on_worker(&iom, || {
            let start = Instant::now();
            assert_eq!(usleep(50_000), 0);
            let req = libc::timespec { tv_sec: 0, tv_nsec: 50_000_000 };
            let mut rem = libc::timespec { tv_sec: 1, tv_nsec: 1 };
            assert_eq!(nanosleep(&req, Some(&mut rem)), 0);
            assert_eq!((rem.tv_sec, rem.tv_nsec), (0, 0));
            start.elapsed()
        });
        assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");

        let bad = libc::timespec { tv_sec: 0, tv_nsec: 2_000_000_000 };
        assert_eq!(nanosleep(&bad, None), -1);
        assert_eq!(errno(), libc::EINVAL);
        iom.stop();
    }

    #[test]
    fn test_read_waits_for_data() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "read").unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        let (fa, fb) = (a.into_raw_fd(), b.into_raw_fd());
        rt.fds().get(fa, true);
        rt.fds().get(fb, true);

        let (tx, rx) = mpsc::channel();
        iom.submit(move || {
            let mut buf = [0u8; 16];
            let n = read(fa, &mut buf);
            tx.send(buf[..n.max(0) as usize].to_vec()).unwrap();
        });
        iom.submit(move || {
            usleep(50_000);
            assert_eq!(write(fb, b"hello"), 5);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hello");
        let closed = on_worker(&iom, move || (close(fa), close(fb)));
        assert_eq!(closed, (0, 0));
        iom.stop();
    }

    #[test]
    fn test_close_wakes_blocked_read() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 2, false, "close").unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        let fa = a.into_raw_fd();
        rt.fds().get(fa, true);

        let (tx, rx) = mpsc::channel();
        iom.submit(move || {
            let mut buf = [0u8; 8];
            let n = read(fa, &mut buf);
            tx.send((n, errno())).unwrap();
        });
        iom.submit(move || {
            usleep(100_000);
            close(fa);
        });

        let (n, e) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(e, libc::EBADF);
        drop(b);
        iom.stop();
    }

    #[test]
    fn test_recv_timeout_from_setsockopt() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "timeout").unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fa = a.as_raw_fd();
        rt.fds().get(fa, true);

        let (n, e, elapsed) = on_worker(&iom, move || {
            let tv = libc::timeval { tv_sec: 0, tv_usec: 100_000 };
            let rc = unsafe {
                setsockopt(
                    fa,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                )
            };
            assert_eq!(rc, 0);
            let start = Instant::now();
            let mut buf = [0u8; 8];
            let n = recv(fa, &mut buf, 0);
            (n, errno(), start.elapsed())
        });

        assert_eq!(n, -1);
        assert_eq!(e, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
        assert_eq!(rt.fds().get(fa, false).unwrap().timeout(TimeoutKind::Recv), Some(100));
        iom.stop();
    }

    #[test]
    fn test_hangup_wakes_reader_and_writer() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "hangup").unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        let fa = a.as_raw_fd();

        a.set_nonblocking(true).unwrap();
        let chunk = [0u8; 4096];
        while std::io::Write::write(&mut a, &chunk).is_ok() {}
        rt.fds().get(fa, true);

        let (tx, rx) = mpsc::channel();
        let rtx = tx.clone();
        iom.submit(move || {
            let mut buf = [0u8; 8];
            let n = read(fa, &mut buf);
            rtx.send(("read", n, errno())).unwrap();
        });
        iom.submit(move || {
            let n = write(fa, b"more");
            tx.send(("write", n, errno())).unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while iom.reactor().registered(fa) != Event::ALL {
            assert!(Instant::now() < deadline, "fibers never parked");
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(b);

        let mut got: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got[0].0, "read");
        assert_eq!(got[0].1, 0);
        assert_eq!(got[1].0, "write");
        assert_eq!(got[1].1, -1);
        assert!(matches!(got[1].2, libc::EPIPE | libc::ECONNRESET), "errno {}", got[1].2);
        assert_eq!(iom.pending_events(), 0);
        rt.fds().remove(fa);
        iom.stop();
    }

    #[test]
    fn test_read_after_late_readiness() {
        // Real descriptor number for epoll, data served by the mock
        let (a, _b) = UnixStream::pair().unwrap();
        let fa = a.as_raw_fd();
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(fa);
        let rt = Runtime::with_syscalls(
            RuntimeConfig::new().epoll_max_timeout(Duration::from_millis(200)),
            mock.clone(),
        )
        .unwrap();
        let iom = IoManager::new(&rt, 1, false, "late").unwrap();
        rt.fds().get(fa, true).unwrap().set_timeout(TimeoutKind::Recv, Some(150));

        let (tx, rx) = mpsc::channel();
        iom.submit(move || {
            let start = Instant::now();
            let mut buf = [0u8; 8];
            let n = read(fa, &mut buf);
            tx.send((buf[..n.max(0) as usize].to_vec(), start.elapsed())).unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));
        // epoll never sees this data, only the retry after the timer does
        mock.push_rx(fa, b"late");

        let (got, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"late");
        assert!(elapsed >= Duration::from_millis(140), "{elapsed:?}");
        assert_eq!(iom.pending_events(), 0);
        iom.stop();
    }

    #[test]
    fn test_connect_and_accept() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "connect").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let rc = on_worker(&iom, move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be() },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            close(fd);
            rc
        });
        assert_eq!(rc, 0);
        listener.accept().unwrap();

        // Hooked accept parks until a client shows up
        let lfd = listener.as_raw_fd();
        rt.fds().get(lfd, true);
        let (tx, rx) = mpsc::channel();
        iom.submit(move || {
            let conn = unsafe { accept(lfd, std::ptr::null_mut(), std::ptr::null_mut()) };
            tx.send(conn).unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let conn = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(conn >= 0);
        assert!(rt.fds().get(conn, false).unwrap().sys_nonblock());
        on_worker(&iom, move || close(conn));
        rt.fds().remove(lfd);
        iom.stop();
    }

    #[test]
    fn test_connect_refused() {
        let rt = runtime();
        let iom = IoManager::new(&rt, 1, false, "refused").unwrap();
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let (rc, e) = on_worker(&iom, move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be() },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                connect_with_timeout(
                    fd,
                    &addr as *const libc::sockaddr_in as *const sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                    Some(1000),
                )
            };
            let e = errno();
            close(fd);
            (rc, e)
        });
        assert_eq!(rc, -1);
        assert_eq!(e, libc::ECONNREFUSED);
        iom.stop();
    }

    #[test]
    fn test_nonblock_illusion() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(7);
        let rt = Runtime::with_syscalls(RuntimeConfig::new(), mock.clone()).unwrap();
        let iom = IoManager::new(&rt, 1, false, "illusion").unwrap();

        let views = on_worker(&iom, || unsafe {
            let ctx = Scheduler::current().unwrap().runtime().fds().get(7, true).unwrap();
            assert!(ctx.sys_nonblock());
            let initial = fcntl(7, libc::F_GETFL, FcntlArg::None);

            fcntl(7, libc::F_SETFL, FcntlArg::Int(libc::O_NONBLOCK));
            let after_set = fcntl(7, libc::F_GETFL, FcntlArg::None);

            let mut off: c_int = 0;
            ioctl(7, libc::FIONBIO as libc::Ioctl, &mut off as *mut c_int as *mut c_void);
            let after_ioctl = fcntl(7, libc::F_GETFL, FcntlArg::None);
            (initial, after_set, after_ioctl, ctx.user_nonblock())
        });

        assert_eq!(views.0 & libc::O_NONBLOCK, 0);
        assert_ne!(views.1 & libc::O_NONBLOCK, 0);
        assert_eq!(views.2 & libc::O_NONBLOCK, 0);
        assert!(!views.3);
        // The kernel side stays non-blocking throughout
        assert_ne!(mock.flags(7) & libc::O_NONBLOCK, 0);
        iom.stop();
    }

    #[test]
    fn test_user_nonblock_passes_eagain_through() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(8);
        let rt = Runtime::with_syscalls(RuntimeConfig::new(), mock.clone()).unwrap();
        let iom = IoManager::new(&rt, 1, false, "user-nb").unwrap();

        let (first, n, e) = on_worker(&iom, || unsafe {
            Scheduler::current().unwrap().runtime().fds().get(8, true);
            fcntl(8, libc::F_SETFL, FcntlArg::Int(libc::O_NONBLOCK));
            let mut buf = [0u8; 4];
            let n = read(8, &mut buf);
            let e = errno();
            (n, read(8, &mut buf), e)
        });
        assert_eq!(first, -1);
        assert_eq!(e, libc::EAGAIN);
        assert_eq!(n, -1);

        mock.push_rx(8, b"ok");
        let got = on_worker(&iom, || {
            let mut buf = [0u8; 4];
            let n = read(8, &mut buf);
            buf[..n.max(0) as usize].to_vec()
        });
        assert_eq!(got, b"ok");
        iom.stop();
    }

    #[test]
    fn test_closed_context_is_ebadf() {
        let mock = Arc::new(MockSyscalls::new());
        mock.add_socket(9);
        let rt = Runtime::with_syscalls(RuntimeConfig::new(), mock.clone()).unwrap();
        let iom = IoManager::new(&rt, 1, false, "ebadf").unwrap();
        rt.fds().get(9, true).unwrap().mark_closed();

        let (n, e) = on_worker(&iom, || (write(9, b"x"), errno()));
        assert_eq!((n, e), (-1, libc::EBADF));
        assert!(mock.tx(9).is_empty());

        assert_eq!(on_worker(&iom, || close(9)), 0);
        assert_eq!(mock.closed(), vec![9]);
        assert!(rt.fds().get(9, false).is_none());
        iom.stop();
    }

    #[test]
    fn test_passthrough_outside_runtime() {
        assert!(!is_enabled());
        let (a, b) = UnixStream::pair().unwrap();
        assert_eq!(write(b.as_raw_fd(), b"abc"), 3);
        let mut buf = [0u8; 8];
        assert_eq!(read(a.as_raw_fd(), &mut buf), 3);
        assert_eq!(&buf[..3], b"abc");

        let start = Instant::now();
        assert_eq!(usleep(20_000), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_sleep_in_plain_scheduler_blocks_thread() {
        let mock = Arc::new(MockSyscalls::new());
        let rt = Runtime::with_syscalls(RuntimeConfig::new(), mock.clone()).unwrap();
        let sched = Scheduler::new(&rt, 1, false, "plain");
        sched.start().unwrap();
        let (tx, rx) = mpsc::channel();
        sched.submit(move || tx.send((is_enabled(), sleep(3))).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), (false, 0));
        assert_eq!(mock.slept(), vec![Duration::from_secs(3)]);
        sched.stop();
    }
}
