//! Built-in defaults for `RuntimeConfig`
//!
//! Every value can be overridden through the `FIO_*` variable named next
//! to it.

/// Usable bytes per fiber stack: 4096 words, 32 KiB on 64-bit targets
/// (`FIO_STACK_SIZE`)
pub const STACK_SIZE: usize = 4096 * std::mem::size_of::<usize>();

/// Hooked `connect` timeout, ms; negative env value disables
/// (`FIO_CONNECT_TIMEOUT_MS`)
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Receive timeout suggested to socket layers built on top, ms
/// (`FIO_RECV_TIMEOUT_MS`)
pub const RECV_TIMEOUT_MS: u64 = 120_000;

/// Upper bound on a single `epoll_wait`, ms (`FIO_EPOLL_MAX_TIMEOUT_MS`)
pub const EPOLL_MAX_TIMEOUT_MS: u64 = 3000;

/// Events fetched per `epoll_wait` (`FIO_EPOLL_BATCH`)
pub const EPOLL_BATCH: usize = 256;

/// Idle wait of a worker without a reactor, ms (`FIO_PARK_TIMEOUT_MS`)
pub const PARK_TIMEOUT_MS: u64 = 100;

/// Raise the log level to debug (`FIO_DEBUG`)
pub const DEBUG: bool = false;
