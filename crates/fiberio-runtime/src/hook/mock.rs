//! In-memory system calls for tests

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use libc::{c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec};

use super::sys::{set_errno, FcntlArg, RealSyscalls};

#[derive(Default)]
struct MockFd {
    socket: bool,
    flags: c_int,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    eof: bool,
    so_error: c_int,
    backlog: VecDeque<RawFd>,
    options: Vec<(c_int, c_int)>,
}

#[derive(Default)]
struct MockState {
    fds: HashMap<RawFd, MockFd>,
    next_fd: RawFd,
    slept: Vec<Duration>,
    closed: Vec<RawFd>,
}

/// Descriptor table kept in memory.
///
/// Reads on an empty non-blocking descriptor fail with `EAGAIN`; on a
/// blocking one they report end of stream.
pub struct MockSyscalls {
    state: Mutex<MockState>,
}

fn fail<T: From<i8>>(e: c_int) -> T {
    set_errno(e);
    T::from(-1)
}

impl MockSyscalls {
    pub fn new() -> Self {
        MockSyscalls {
            state: Mutex::new(MockState {
                next_fd: 1000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_socket(&self, fd: RawFd) {
        self.state().fds.insert(fd, MockFd { socket: true, ..Default::default() });
    }

    pub fn add_file(&self, fd: RawFd) {
        self.state().fds.insert(fd, MockFd::default());
    }

    /// Kernel view of the status flags
    pub fn flags(&self, fd: RawFd) -> c_int {
        self.state().fds.get(&fd).map(|f| f.flags).unwrap_or(-1)
    }

    pub fn push_rx(&self, fd: RawFd, data: &[u8]) {
        if let Some(f) = self.state().fds.get_mut(&fd) {
            f.rx.extend(data.iter().copied());
        }
    }

    pub fn set_eof(&self, fd: RawFd) {
        if let Some(f) = self.state().fds.get_mut(&fd) {
            f.eof = true;
        }
    }

    pub fn tx(&self, fd: RawFd) -> Vec<u8> {
        self.state().fds.get(&fd).map(|f| f.tx.clone()).unwrap_or_default()
    }

    pub fn push_accept(&self, listener: RawFd, conn: RawFd) {
        let mut st = self.state();
        st.fds.insert(conn, MockFd { socket: true, ..Default::default() });
        if let Some(f) = st.fds.get_mut(&listener) {
            f.backlog.push_back(conn);
        }
    }

    pub fn set_so_error(&self, fd: RawFd, err: c_int) {
        if let Some(f) = self.state().fds.get_mut(&fd) {
            f.so_error = err;
        }
    }

    /// `(level, name)` pairs passed to `setsockopt`
    pub fn options(&self, fd: RawFd) -> Vec<(c_int, c_int)> {
        self.state().fds.get(&fd).map(|f| f.options.clone()).unwrap_or_default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.state().slept.clone()
    }

    pub fn closed(&self) -> Vec<RawFd> {
        self.state().closed.clone()
    }

    fn recv_into(&self, fd: RawFd, buf: &mut [u8]) -> ssize_t {
        let mut st = self.state();
        let Some(f) = st.fds.get_mut(&fd) else {
            return fail(libc::EBADF);
        };
        if f.rx.is_empty() {
            if f.eof || f.flags & libc::O_NONBLOCK == 0 {
                return 0;
            }
            return fail(libc::EAGAIN);
        }
        let n = buf.len().min(f.rx.len());
        for (dst, src) in buf.iter_mut().zip(f.rx.drain(..n)) {
            *dst = src;
        }
        n as ssize_t
    }

    fn send_from(&self, fd: RawFd, buf: &[u8]) -> ssize_t {
        let mut st = self.state();
        match st.fds.get_mut(&fd) {
            Some(f) => {
                f.tx.extend_from_slice(buf);
                buf.len() as ssize_t
            }
            None => fail(libc::EBADF),
        }
    }

    unsafe fn recv_iov(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        if iovcnt < 1 {
            return 0;
        }
        let first = &*iov;
        let buf = std::slice::from_raw_parts_mut(first.iov_base as *mut u8, first.iov_len);
        self.recv_into(fd, buf)
    }

    unsafe fn send_iov(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        let mut total = 0;
        for v in std::slice::from_raw_parts(iov, iovcnt.max(0) as usize) {
            let buf = std::slice::from_raw_parts(v.iov_base as *const u8, v.iov_len);
            let n = self.send_from(fd, buf);
            if n < 0 {
                return n;
            }
            total += n;
        }
        total
    }
}

impl RealSyscalls for MockSyscalls {
    unsafe fn read(&self, fd: RawFd, buf: *mut c_void, count: size_t) -> ssize_t {
        self.recv_into(fd, std::slice::from_raw_parts_mut(buf as *mut u8, count))
    }

    unsafe fn readv(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        self.recv_iov(fd, iov, iovcnt)
    }

    unsafe fn recv(&self, fd: RawFd, buf: *mut c_void, len: size_t, _flags: c_int) -> ssize_t {
        self.read(fd, buf, len)
    }

    unsafe fn recvfrom(
        &self,
        fd: RawFd,
        buf: *mut c_void,
        len: size_t,
        _flags: c_int,
        _addr: *mut sockaddr,
        _addrlen: *mut socklen_t,
    ) -> ssize_t {
        self.read(fd, buf, len)
    }

    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut msghdr, _flags: c_int) -> ssize_t {
        self.recv_iov(fd, (*msg).msg_iov, (*msg).msg_iovlen as c_int)
    }

    unsafe fn write(&self, fd: RawFd, buf: *const c_void, count: size_t) -> ssize_t {
        self.send_from(fd, std::slice::from_raw_parts(buf as *const u8, count))
    }

    unsafe fn writev(&self, fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
        self.send_iov(fd, iov, iovcnt)
    }

    unsafe fn send(&self, fd: RawFd, buf: *const c_void, len: size_t, _flags: c_int) -> ssize_t {
        self.write(fd, buf, len)
    }

    unsafe fn sendto(
        &self,
        fd: RawFd,
        buf: *const c_void,
        len: size_t,
        _flags: c_int,
        _addr: *const sockaddr,
        _addrlen: socklen_t,
    ) -> ssize_t {
        self.write(fd, buf, len)
    }

    unsafe fn sendmsg(&self, fd: RawFd, msg: *const msghdr, _flags: c_int) -> ssize_t {
        self.send_iov(fd, (*msg).msg_iov, (*msg).msg_iovlen as c_int)
    }

    fn socket(&self, _domain: c_int, _ty: c_int, _protocol: c_int) -> RawFd {
        let mut st = self.state();
        let fd = st.next_fd;
        st.next_fd += 1;
        st.fds.insert(fd, MockFd { socket: true, ..Default::default() });
        fd
    }

    unsafe fn connect(&self, fd: RawFd, _addr: *const sockaddr, _len: socklen_t) -> c_int {
        let st = self.state();
        match st.fds.get(&fd) {
            Some(f) if f.flags & libc::O_NONBLOCK != 0 => fail(libc::EINPROGRESS),
            Some(_) => 0,
            None => fail(libc::EBADF),
        }
    }

    unsafe fn accept(&self, fd: RawFd, _addr: *mut sockaddr, _len: *mut socklen_t) -> RawFd {
        let mut st = self.state();
        let Some(f) = st.fds.get_mut(&fd) else {
            return fail(libc::EBADF);
        };
        match f.backlog.pop_front() {
            Some(conn) => conn,
            None => fail(libc::EAGAIN),
        }
    }

    fn close(&self, fd: RawFd) -> c_int {
        let mut st = self.state();
        if st.fds.remove(&fd).is_none() {
            return fail(libc::EBADF);
        }
        st.closed.push(fd);
        0
    }

    unsafe fn fcntl(&self, fd: RawFd, cmd: c_int, arg: FcntlArg) -> c_int {
        let mut st = self.state();
        let Some(f) = st.fds.get_mut(&fd) else {
            return fail(libc::EBADF);
        };
        match (cmd, arg) {
            (libc::F_GETFL, _) => f.flags,
            (libc::F_SETFL, FcntlArg::Int(flags)) => {
                f.flags = flags;
                0
            }
            _ => 0,
        }
    }

    unsafe fn ioctl(&self, fd: RawFd, request: libc::Ioctl, arg: *mut c_void) -> c_int {
        let mut st = self.state();
        let Some(f) = st.fds.get_mut(&fd) else {
            return fail(libc::EBADF);
        };
        if request == libc::FIONBIO as libc::Ioctl && !arg.is_null() {
            if *(arg as *const c_int) != 0 {
                f.flags |= libc::O_NONBLOCK;
            } else {
                f.flags &= !libc::O_NONBLOCK;
            }
        }
        0
    }

    unsafe fn getsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        val: *mut c_void,
        len: *mut socklen_t,
    ) -> c_int {
        let st = self.state();
        let Some(f) = st.fds.get(&fd) else {
            return fail(libc::EBADF);
        };
        if level == libc::SOL_SOCKET && name == libc::SO_ERROR {
            *(val as *mut c_int) = f.so_error;
            *len = std::mem::size_of::<c_int>() as socklen_t;
        }
        0
    }

    unsafe fn setsockopt(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        _val: *const c_void,
        _len: socklen_t,
    ) -> c_int {
        let mut st = self.state();
        match st.fds.get_mut(&fd) {
            Some(f) => {
                f.options.push((level, name));
                0
            }
            None => fail(libc::EBADF),
        }
    }

    fn sleep(&self, secs: c_uint) -> c_uint {
        self.state().slept.push(Duration::from_secs(secs as u64));
        0
    }

    fn usleep(&self, usec: libc::useconds_t) -> c_int {
        self.state().slept.push(Duration::from_micros(usec as u64));
        0
    }

    unsafe fn nanosleep(&self, req: *const timespec, _rem: *mut timespec) -> c_int {
        let req = &*req;
        let d = Duration::new(req.tv_sec as u64, req.tv_nsec as u32);
        self.state().slept.push(d);
        0
    }

    fn fstat_is_socket(&self, fd: RawFd) -> Option<bool> {
        self.state().fds.get(&fd).map(|f| f.socket)
    }
}
