//! Self-pipe used to interrupt `epoll_wait`

use std::os::fd::RawFd;

use fiberio_core::{kwarn, RuntimeError, RuntimeResult};

use crate::hook::sys::{errno, LibcSyscalls, RealSyscalls};

/// epoll user data of the pipe's read end; descriptors use their own number
pub(crate) const TICKLE_TOKEN: u64 = u64::MAX;

pub(crate) struct TicklePipe {
    read: RawFd,
    write: RawFd,
    sys: LibcSyscalls,
}

impl TicklePipe {
    pub(crate) fn new() -> RuntimeResult<TicklePipe> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(RuntimeError::Pipe(errno()));
        }
        Ok(TicklePipe {
            read: fds[0],
            write: fds[1],
            sys: LibcSyscalls::new(),
        })
    }

    #[inline]
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read
    }

    pub(crate) fn notify(&self) {
        let byte = [b'T'];
        let n = unsafe { self.sys.write(self.write, byte.as_ptr() as *const libc::c_void, 1) };
        // A full pipe already guarantees a wake-up
        if n < 0 && errno() != libc::EAGAIN {
            kwarn!("tickle write failed: {}", nix::errno::Errno::from_raw(errno()).desc());
        }
    }

    /// Consume every pending notification
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                self.sys
                    .read(self.read, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for TicklePipe {
    fn drop(&mut self) {
        self.sys.close(self.read);
        self.sys.close(self.write);
    }
}
