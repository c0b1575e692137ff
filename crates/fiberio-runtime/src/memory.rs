//! Fiber stacks
//!
//! Each stack is its own anonymous mapping with a `PROT_NONE` guard page at
//! the low end, so an overflow faults instead of corrupting a neighbour.
//!
//! ```text
//! base                      base + GUARD_SIZE                 base + len
//! ├── guard (PROT_NONE) ────┼── usable (RW), grows downward ──┤ top
//! ```

use fiberio_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use fiberio_core::kerror;

/// An owned, guarded stack mapping
pub struct Stack {
    base: *mut u8,
    len: usize,
}

// The mapping is plain memory owned by exactly one fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    ///
    /// Failing to map a stack leaves the runtime with no way to run the
    /// fiber, so this logs and aborts the process.
    pub fn new(size: usize) -> Stack {
        match Self::try_new(size) {
            Ok(stack) => stack,
            Err(errno) => {
                kerror!(
                    "failed to map fiber stack of {} bytes: {}",
                    size,
                    nix::errno::Errno::from_raw(errno).desc()
                );
                std::process::abort();
            }
        }
    }

    /// Map a stack, returning the errno on failure
    pub fn try_new(size: usize) -> Result<Stack, i32> {
        let page = page_size();
        let usable = size.max(MIN_STACK_SIZE).div_ceil(page) * page;
        let guard = GUARD_SIZE.div_ceil(page) * page;
        let len = usable + guard;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(nix::errno::Errno::last_raw());
        }

        // Overflow runs into the lowest page
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if ret != 0 {
            let errno = nix::errno::Errno::last_raw();
            unsafe { libc::munmap(base, len) };
            return Err(errno);
        }

        Ok(Stack { base: base as *mut u8, len })
    }

    /// Highest address of the stack (exclusive)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Bytes usable by the fiber (excludes the guard page)
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.len - GUARD_SIZE.div_ceil(page_size()) * page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        if ret != 0 {
            kerror!("munmap of fiber stack at {:p} failed", self.base);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
