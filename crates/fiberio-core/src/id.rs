//! Fiber identifier type

use core::fmt;

/// Identifier of a fiber
///
/// Ids are handed out by a `Runtime` in increasing order, starting at 1.
/// Id 0 is reserved for the implicit root fiber of every OS thread.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Id of a thread's root fiber
    pub const ROOT: FiberId = FiberId(0);

    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for the implicit per-thread root fiber
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "FiberId(ROOT)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_basics() {
        let id = FiberId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(!id.is_root());
        assert!(FiberId::ROOT.is_root());
        assert_eq!(FiberId::default(), FiberId::ROOT);
    }

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(format!("{}", FiberId::new(7)), "7");
        assert_eq!(format!("{}", FiberId::ROOT), "root");
        assert_eq!(format!("{:?}", FiberId::new(7)), "FiberId(7)");
    }

    #[test]
    fn test_fiber_id_ordering() {
        let a: FiberId = 1u64.into();
        let b: FiberId = 2u64.into();
        assert!(a < b);
        let raw: u64 = b.into();
        assert_eq!(raw, 2);
    }
}
