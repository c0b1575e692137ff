//! Process-wide signal setup

use std::sync::Once;

use fiberio_core::{kdebug, kwarn};
use nix::sys::signal::{self, SigHandler, Signal};

static IGNORE_SIGPIPE: Once = Once::new();

/// Ignore `SIGPIPE` so writes to a closed peer fail with `EPIPE`.
///
/// Runs once per process.
pub fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| {
        match unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            Ok(_) => kdebug!("SIGPIPE ignored"),
            Err(e) => kwarn!("could not ignore SIGPIPE: {}", e.desc()),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigpipe_ignored() {
        ignore_sigpipe();
        ignore_sigpipe();
        let prev = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }.unwrap();
        assert_eq!(prev, SigHandler::SigIgn);
    }
}
