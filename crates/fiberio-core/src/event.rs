//! I/O interest mask
//!
//! Values match the epoll bits so the reactor can use them unchanged:
//! `READ` is `EPOLLIN`, `WRITE` is `EPOLLOUT`.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Set of I/O directions a waiter is interested in
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    /// Both directions
    pub const ALL: Event = Event(0x1 | 0x4);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Event(bits & Self::ALL.0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn without(self, other: Event) -> Self {
        Event(self.0 & !other.0)
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({})", self)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ|WRITE"),
        }
    }
}
