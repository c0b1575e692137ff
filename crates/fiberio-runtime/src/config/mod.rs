//! Runtime configuration
//!
//! Compile-time defaults (`defaults`) with environment overrides.
//!
//! ```rust,ignore
//! use fiberio_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .stack_size(256 * 1024)
//!     .connect_timeout(Some(Duration::from_secs(1)));
//! ```

pub mod defaults;

use std::time::Duration;

use fiberio_core::constants::MIN_STACK_SIZE;
use fiberio_core::env::{env_get, env_get_bool, env_get_ms};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size for fibers created without an explicit size
    pub stack_size: usize,
    /// Timeout of hooked `connect`; `None` waits forever
    pub connect_timeout: Option<Duration>,
    /// Receive timeout for socket layers built on the runtime
    pub recv_timeout: Option<Duration>,
    /// Cap on one `epoll_wait` so timers and stop requests are noticed
    pub epoll_max_timeout: Duration,
    /// Event buffer length per `epoll_wait`
    pub epoll_batch: usize,
    /// Idle wait for schedulers without an I/O reactor
    pub park_timeout: Duration,
    /// Debug logging
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with `FIO_*` environment overrides.
    ///
    /// - `FIO_STACK_SIZE`
    /// - `FIO_CONNECT_TIMEOUT_MS` (negative = no timeout)
    /// - `FIO_RECV_TIMEOUT_MS` (negative = no timeout)
    /// - `FIO_EPOLL_MAX_TIMEOUT_MS`
    /// - `FIO_EPOLL_BATCH`
    /// - `FIO_PARK_TIMEOUT_MS`
    /// - `FIO_DEBUG`
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("FIO_STACK_SIZE", defaults::STACK_SIZE),
            connect_timeout: env_get_ms("FIO_CONNECT_TIMEOUT_MS", Some(defaults::CONNECT_TIMEOUT_MS)),
            recv_timeout: env_get_ms("FIO_RECV_TIMEOUT_MS", Some(defaults::RECV_TIMEOUT_MS)),
            epoll_max_timeout: Duration::from_millis(env_get(
                "FIO_EPOLL_MAX_TIMEOUT_MS",
                defaults::EPOLL_MAX_TIMEOUT_MS,
            )),
            epoll_batch: env_get("FIO_EPOLL_BATCH", defaults::EPOLL_BATCH),
            park_timeout: Duration::from_millis(env_get(
                "FIO_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            debug: env_get_bool("FIO_DEBUG", defaults::DEBUG),
        }
    }

    /// Defaults only, environment ignored. Useful in tests.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            connect_timeout: Some(Duration::from_millis(defaults::CONNECT_TIMEOUT_MS)),
            recv_timeout: Some(Duration::from_millis(defaults::RECV_TIMEOUT_MS)),
            epoll_max_timeout: Duration::from_millis(defaults::EPOLL_MAX_TIMEOUT_MS),
            epoll_batch: defaults::EPOLL_BATCH,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            debug: defaults::DEBUG,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn connect_timeout(mut self, d: Option<Duration>) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn recv_timeout(mut self, d: Option<Duration>) -> Self {
        self.recv_timeout = d;
        self
    }

    pub fn epoll_max_timeout(mut self, d: Duration) -> Self {
        self.epoll_max_timeout = d;
        self
    }

    pub fn epoll_batch(mut self, n: usize) -> Self {
        self.epoll_batch = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.epoll_batch == 0 {
            return Err(ConfigError::InvalidValue("epoll_batch must be > 0"));
        }
        if self.epoll_max_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("epoll_max_timeout must be > 0"));
        }
        if self.epoll_max_timeout.as_millis() > i32::MAX as u128 {
            return Err(ConfigError::InvalidValue("epoll_max_timeout does not fit epoll_wait"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        Ok(())
    }

    pub fn print(&self) {
        eprintln!("fiberio configuration:");
        eprintln!("  stack_size:         {}", self.stack_size);
        eprintln!("  connect_timeout:    {:?}", self.connect_timeout);
        eprintln!("  recv_timeout:       {:?}", self.recv_timeout);
        eprintln!("  epoll_max_timeout:  {:?}", self.epoll_max_timeout);
        eprintln!("  epoll_batch:        {}", self.epoll_batch);
        eprintln!("  park_timeout:       {:?}", self.park_timeout);
        eprintln!("  debug:              {}", self.debug);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
