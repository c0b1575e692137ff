//! Fiber state machine

use core::fmt;

/// State of a fiber
///
/// ```text
///   INIT ──► EXEC ──► READY ──┐
///              ▲  ├─► HOLD  ──┤
///              │  ├─► TERM    │
///              │  └─► EXCEPT  │
///              └──────────────┘
/// ```
///
/// `TERM` and `EXCEPT` are terminal until the fiber is `reset`, which
/// puts it back to `INIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created (or reset), never run
    Init = 0,

    /// Suspended, eligible for rescheduling
    Ready = 1,

    /// Currently executing on some OS thread
    Exec = 2,

    /// Suspended until explicitly resumed (I/O event, timer, ...)
    Hold = 3,

    /// Callback returned normally
    Term = 4,

    /// Callback panicked
    Except = 5,
}

impl FiberState {
    /// Callback has finished, one way or another
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// `reset` may reuse the stack of a fiber in this state
    #[inline]
    pub const fn can_reset(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }

    /// A scheduler may switch into a fiber in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }

    /// Whether `self -> next` is an edge of the state graph
    pub const fn can_transition_to(&self, next: FiberState) -> bool {
        use FiberState::*;
        match (*self, next) {
            (Init, Exec) | (Ready, Exec) | (Hold, Exec) => true,
            (Exec, Ready) | (Exec, Hold) | (Exec, Term) | (Exec, Except) => true,
            // reset
            (Init, Init) | (Term, Init) | (Except, Init) => true,
            _ => false,
        }
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(s)
    }
}
