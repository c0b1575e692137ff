//! Error types for the fiberio runtime

use core::fmt;

use crate::event::Event;
use crate::state::FiberState;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised by the scheduler, the reactor and the timer layer
///
/// Errors carrying an `errno` keep the raw value so callers can compare
/// against `libc` constants; `Display` renders the OS description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A waiter is already registered for this (fd, event) pair
    EventExists { fd: i32, event: Event },

    /// `epoll_ctl` rejected a registration change
    EpollCtl { fd: i32, op: &'static str, errno: i32 },

    /// `epoll_create1` / `epoll_wait` failed
    Epoll(i32),

    /// Tickle pipe could not be created or configured
    Pipe(i32),

    /// Fiber is in a state that does not allow the operation
    InvalidState(FiberState),

    /// Operation needs a running scheduler on the calling thread
    NotInScheduler,

    /// `start` called twice
    AlreadyStarted,

    /// Worker OS thread could not be spawned
    SpawnFailed,

    /// Any other failed system call
    Os(i32),
}

impl RuntimeError {
    /// Raw errno, if the error came from the OS
    pub fn errno(&self) -> Option<i32> {
        match self {
            RuntimeError::EpollCtl { errno, .. } => Some(*errno),
            RuntimeError::Epoll(e) | RuntimeError::Pipe(e) | RuntimeError::Os(e) => Some(*e),
            _ => None,
        }
    }
}

fn os_desc(errno: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno)
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::EventExists { fd, event } => {
                write!(f, "event {} already registered on fd {}", event, fd)
            }
            RuntimeError::EpollCtl { fd, op, errno } => {
                write!(f, "epoll_ctl({}) on fd {} failed: {}", op, fd, os_desc(*errno))
            }
            RuntimeError::Epoll(e) => write!(f, "epoll failed: {}", os_desc(*e)),
            RuntimeError::Pipe(e) => write!(f, "tickle pipe failed: {}", os_desc(*e)),
            RuntimeError::InvalidState(s) => write!(f, "invalid fiber state {}", s),
            RuntimeError::NotInScheduler => write!(f, "not running inside a scheduler"),
            RuntimeError::AlreadyStarted => write!(f, "scheduler already started"),
            RuntimeError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            RuntimeError::Os(e) => write!(f, "os error: {}", os_desc(*e)),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<RuntimeError> for std::io::Error {
    fn from(e: RuntimeError) -> Self {
        match e.errno() {
            Some(errno) => std::io::Error::from_raw_os_error(errno),
            None => std::io::Error::other(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::EventExists { fd: 5, event: Event::READ };
        assert_eq!(e.to_string(), "event READ already registered on fd 5");

        let e = RuntimeError::InvalidState(FiberState::Exec);
        assert_eq!(e.to_string(), "invalid fiber state EXEC");
    }

    #[test]
    fn test_errno_passthrough() {
        // EBADF == 9 on every Linux target
        let e = RuntimeError::EpollCtl { fd: -1, op: "ADD", errno: 9 };
        assert_eq!(e.errno(), Some(9));
        let io: std::io::Error = e.into();
        assert_eq!(io.raw_os_error(), Some(9));

        let io: std::io::Error = RuntimeError::NotInScheduler.into();
        assert_eq!(io.raw_os_error(), None);
    }

    #[test]
    fn test_os_error_described() {
        let e = RuntimeError::EpollCtl { fd: -1, op: "ADD", errno: 9 };
        assert_eq!(
            e.to_string(),
            format!("epoll_ctl(ADD) on fd -1 failed: {}", std::io::Error::from_raw_os_error(9))
        );
        assert!(RuntimeError::Os(9).to_string().contains("os error 9"));
    }
}
