//! The real system calls behind the hook layer
//!
//! Everything the runtime needs from libc for hooked descriptors goes
//! through `RealSyscalls`, so tests can swap in a mock. `LibcSyscalls`
//! calls libc directly, or, with the `interpose` feature, the next
//! definition of each symbol found by `dlsym(RTLD_NEXT)` (the crate then
//! exports its own `read`, `write`, ... symbols).

use std::mem::MaybeUninit;
use std::os::fd::RawFd;

use libc::{c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec};

/// Third argument of `fcntl`
#[derive(Debug, Clone, Copy)]
pub enum FcntlArg {
    None,
    Int(c_int),
    Ptr(*mut c_void),
}

/// Raw errno of the calling thread
#[inline]
pub fn errno() -> c_int {
    nix::errno::Errno::last_raw()
}

#[inline]
pub fn set_errno(e: c_int) {
    nix::errno::Errno::set_raw(e);
}

/// System calls used by the hook layer and the fd table.
///
/// Methods keep the libc contract: `-1` plus errno on failure.
///
/// # Safety
///
/// Pointer arguments must satisfy the requirements of the matching libc
/// function.
#[allow(clippy::missing_safety_doc)]
pub trait RealSyscalls: Send + Sync + 'static {
    unsafe fn read(&self, fd: RawFd, buf: *mut c_void, count: size_t) -> ssize_t;
    unsafe fn readv(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    unsafe fn recv(&self, fd: RawFd, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t;
    unsafe fn recvfrom(
        &self,
        fd: RawFd,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t;
    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t;

    unsafe fn write(&self, fd: RawFd, buf: *const c_void, count: size_t) -> ssize_t;
    unsafe fn writev(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    unsafe fn send(&self, fd: RawFd, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;
    unsafe fn sendto(
        &self,
        fd: RawFd,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t;
    unsafe fn sendmsg(&self, fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t;

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> RawFd;
    unsafe fn connect(&self, fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int;
    unsafe fn accept(&self, fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> RawFd;
    fn close(&self, fd: RawFd) -> c_int;

    unsafe fn fcntl(&self, fd: RawFd, cmd: c_int, arg: FcntlArg) -> c_int;
    unsafe fn ioctl(&self, fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> c_int;
    unsafe fn getsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        val: *mut c_void,
        len: *mut socklen_t,
    ) -> c_int;
    unsafe fn setsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        val: *const c_void,
        len: socklen_t,
    ) -> c_int;

    fn sleep(&self, secs: c_uint) -> c_uint;
    fn usleep(&self, usec: libc::useconds_t) -> c_int;
    unsafe fn nanosleep(&self, req: *const timespec, rem: *mut timespec) -> c_int;

    /// `Some(is_socket)` when `fstat` succeeds
    fn fstat_is_socket(&self, fd: RawFd) -> Option<bool>;
}

#[cfg(not(feature = "interpose"))]
macro_rules! real {
    ($name:ident) => {
        libc::$name
    };
}

#[cfg(feature = "interpose")]
macro_rules! real {
    ($name:ident) => {
        next::symbols().$name
    };
}

/// The process's libc
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSyscalls;

impl LibcSyscalls {
    pub const fn new() -> Self {
        LibcSyscalls
    }
}

impl RealSyscalls for LibcSyscalls {
    unsafe fn read(&self, fd: RawFd, buf: *mut c_void, count: size_t) -> ssize_t {
        real!(read)(fd, buf, count)
    }

    unsafe fn readv(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        real!(readv)(fd, iov, iovcnt)
    }

    unsafe fn recv(&self, fd: RawFd, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
        real!(recv)(fd, buf, len, flags)
    }

    unsafe fn recvfrom(
        &self,
        fd: RawFd,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t {
        real!(recvfrom)(fd, buf, len, flags, addr, addrlen)
    }

    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t {
        real!(recvmsg)(fd, msg, flags)
    }

    unsafe fn write(&self, fd: RawFd, buf: *const c_void, count: size_t) -> ssize_t {
        real!(write)(fd, buf, count)
    }

    unsafe fn writev(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        real!(writev)(fd, iov, iovcnt)
    }

    unsafe fn send(&self, fd: RawFd, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
        real!(send)(fd, buf, len, flags)
    }

    unsafe fn sendto(
        &self,
        fd: RawFd,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t {
        real!(sendto)(fd, buf, len, flags, addr, addrlen)
    }

    unsafe fn sendmsg(&self, fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t {
        real!(sendmsg)(fd, msg, flags)
    }

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> RawFd {
        unsafe { real!(socket)(domain, ty, protocol) }
    }

    unsafe fn connect(&self, fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int {
        real!(connect)(fd, addr, len)
    }

    unsafe fn accept(&self, fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> RawFd {
        real!(accept)(fd, addr, len)
    }

    fn close(&self, fd: RawFd) -> c_int {
        unsafe { real!(close)(fd) }
    }

    unsafe fn fcntl(&self, fd: RawFd, cmd: c_int, arg: FcntlArg) -> c_int {
        match arg {
            FcntlArg::None => real!(fcntl)(fd, cmd),
            FcntlArg::Int(v) => real!(fcntl)(fd, cmd, v),
            FcntlArg::Ptr(p) => real!(fcntl)(fd, cmd, p),
        }
    }

    unsafe fn ioctl(&self, fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> c_int {
        real!(ioctl)(fd, request, arg)
    }

    unsafe fn getsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        val: *mut c_void,
        len: *mut socklen_t,
    ) -> c_int {
        real!(getsockopt)(fd, level, name, val, len)
    }

    unsafe fn setsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        val: *const c_void,
        len: socklen_t,
    ) -> c_int {
        real!(setsockopt)(fd, level, name, val, len)
    }

    fn sleep(&self, secs: c_uint) -> c_uint {
        unsafe { real!(sleep)(secs) }
    }

    fn usleep(&self, usec: libc::useconds_t) -> c_int {
        unsafe { real!(usleep)(usec) }
    }

    unsafe fn nanosleep(&self, req: *const timespec, rem: *mut timespec) -> c_int {
        real!(nanosleep)(req, rem)
    }

    fn fstat_is_socket(&self, fd: RawFd) -> Option<bool> {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
            return None;
        }
        let st = unsafe { st.assume_init() };
        Some(st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
    }
}

#[cfg(feature = "interpose")]
mod next {
    //! Symbols shadowed by the exported hooks, resolved past this object

    use std::sync::OnceLock;

    use libc::{
        c_char, c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t,
        timespec,
    };

    pub(super) struct Symbols {
        pub read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
        pub readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
        pub recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
        pub recvfrom: unsafe extern "C" fn(
            c_int,
            *mut c_void,
            size_t,
            c_int,
            *mut sockaddr,
            *mut socklen_t,
        ) -> ssize_t,
        pub recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t,
        pub write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
        pub writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
        pub send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
        pub sendto: unsafe extern "C" fn(
            c_int,
            *const c_void,
            size_t,
            c_int,
            *const sockaddr,
            socklen_t,
        ) -> ssize_t,
        pub sendmsg: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t,
        pub socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
        pub connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int,
        pub accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
        pub close: unsafe extern "C" fn(c_int) -> c_int,
        pub fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int,
        pub ioctl: unsafe extern "C" fn(c_int, libc::Ioctl, ...) -> c_int,
        pub getsockopt:
            unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
        pub setsockopt:
            unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
        pub sleep: unsafe extern "C" fn(c_uint) -> c_uint,
        pub usleep: unsafe extern "C" fn(libc::useconds_t) -> c_int,
        pub nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int,
    }

    static SYMBOLS: OnceLock<Symbols> = OnceLock::new();

    pub(super) fn symbols() -> &'static Symbols {
        SYMBOLS.get_or_init(resolve)
    }

    fn lookup(name: &'static [u8]) -> *mut c_void {
        let p = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) };
        if p.is_null() {
            // Logging would recurse into the hooked write
            let msg = b"fiberio: dlsym(RTLD_NEXT) failed for a hooked symbol\n";
            unsafe {
                libc::syscall(libc::SYS_write, 2, msg.as_ptr(), msg.len());
                libc::abort();
            }
        }
        p
    }

    macro_rules! next_fn {
        ($name:ident) => {
            unsafe { std::mem::transmute(lookup(concat!(stringify!($name), "\0").as_bytes())) }
        };
    }

    fn resolve() -> Symbols {
        Symbols {
            read: next_fn!(read),
            readv: next_fn!(readv),
            recv: next_fn!(recv),
            recvfrom: next_fn!(recvfrom),
            recvmsg: next_fn!(recvmsg),
            write: next_fn!(write),
            writev: next_fn!(writev),
            send: next_fn!(send),
            sendto: next_fn!(sendto),
            sendmsg: next_fn!(sendmsg),
            socket: next_fn!(socket),
            connect: next_fn!(connect),
            accept: next_fn!(accept),
            close: next_fn!(close),
            fcntl: next_fn!(fcntl),
            ioctl: next_fn!(ioctl),
            getsockopt: next_fn!(getsockopt),
            setsockopt: next_fn!(setsockopt),
            sleep: next_fn!(sleep),
            usleep: next_fn!(usleep),
            nanosleep: next_fn!(nanosleep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fstat_kind() {
        let sys = LibcSyscalls::new();
        let (a, _b) = UnixStream::pair().unwrap();
        assert_eq!(sys.fstat_is_socket(a.as_raw_fd()), Some(true));

        let file = std::fs::File::open("/proc/self/stat").unwrap();
        assert_eq!(sys.fstat_is_socket(file.as_raw_fd()), Some(false));
        assert_eq!(sys.fstat_is_socket(-1), None);
    }

    #[test]
    fn test_errno_roundtrip() {
        set_errno(libc::ETIMEDOUT);
        assert_eq!(errno(), libc::ETIMEDOUT);
        set_errno(0);
        assert_eq!(errno(), 0);
    }

    #[test]
    fn test_read_write_pair() {
        let sys = LibcSyscalls::new();
        let (a, b) = UnixStream::pair().unwrap();
        let msg = b"ping";
        let n = unsafe { sys.write(a.as_raw_fd(), msg.as_ptr() as *const c_void, msg.len()) };
        assert_eq!(n, 4);
        let mut buf = [0u8; 8];
        let n = unsafe { sys.read(b.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(&buf[..n as usize], msg);
    }
}
