//! Exported libc symbols
//!
//! With the `interpose` feature the hooks are exported under the libc
//! names, so code linked into the same binary (including C libraries)
//! picks them up instead of the libc versions. The originals are reached
//! through `dlsym(RTLD_NEXT)` in `sys`.
//!
//! `fcntl` and `ioctl` are variadic in C. They are exported with a single
//! word-sized argument, which matches the calling convention of the
//! supported targets for every integer or pointer argument.

use std::os::fd::RawFd;

use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t};

use fiberio_core::Event;

use crate::fd::TimeoutKind;

use super::sys::FcntlArg;

#[no_mangle]
pub extern "C" fn sleep(secs: c_uint) -> c_uint {
    super::sleep(secs)
}

#[no_mangle]
pub extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    super::usleep(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if req.is_null() {
        super::set_errno(libc::EFAULT);
        return -1;
    }
    super::nanosleep(&*req, rem.as_mut())
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    super::socket(domain, ty, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    super::connect(fd, addr, len)
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    super::accept(fd, addr, len)
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    super::do_io(fd, "read", Event::READ, TimeoutKind::Recv, |sys| {
        sys.read(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    super::do_io(fd, "readv", Event::READ, TimeoutKind::Recv, |sys| {
        sys.readv(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    super::do_io(fd, "recv", Event::READ, TimeoutKind::Recv, |sys| {
        sys.recv(fd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    super::recvfrom(fd, buf, len, flags, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    super::recvmsg(fd, msg, flags)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    super::do_io(fd, "write", Event::WRITE, TimeoutKind::Send, |sys| {
        sys.write(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    super::do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, |sys| {
        sys.writev(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    super::do_io(fd, "send", Event::WRITE, TimeoutKind::Send, |sys| {
        sys.send(fd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    super::sendto(fd, buf, len, flags, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    super::sendmsg(fd, msg, flags)
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    super::close(fd)
}

/// Commands whose third argument is a pointer
fn fcntl_takes_ptr(cmd: c_int) -> bool {
    matches!(
        cmd,
        libc::F_GETLK
            | libc::F_SETLK
            | libc::F_SETLKW
            | libc::F_OFD_GETLK
            | libc::F_OFD_SETLK
            | libc::F_OFD_SETLKW
    )
}

fn fcntl_arg(cmd: c_int, arg: c_ulong) -> FcntlArg {
    match cmd {
        libc::F_GETFD | libc::F_GETFL | libc::F_GETOWN | libc::F_GETPIPE_SZ => FcntlArg::None,
        _ if fcntl_takes_ptr(cmd) => FcntlArg::Ptr(arg as *mut c_void),
        _ => FcntlArg::Int(arg as c_int),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: RawFd, cmd: c_int, arg: c_ulong) -> c_int {
    super::fcntl(fd, cmd, fcntl_arg(cmd, arg))
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> c_int {
    super::ioctl(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    val: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    super::getsockopt(fd, level, name, val, len)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    val: *const c_void,
    len: socklen_t,
) -> c_int {
    super::setsockopt(fd, level, name, val, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fcntl_arg_kinds() {
        assert!(matches!(fcntl_arg(libc::F_GETFL, 7), FcntlArg::None));
        assert!(matches!(fcntl_arg(libc::F_SETFL, 0x800), FcntlArg::Int(0x800)));
        assert!(matches!(fcntl_arg(libc::F_SETLK, 0x1000), FcntlArg::Ptr(p) if p as usize == 0x1000));
    }
}
