//! Replication timestamps
//!
//! A timestamp is a `(seconds, increment)` pair ordered lexicographically.
//! The all-zero value is the null timestamp and means "not assigned".

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    secs: u32,
    inc: u32,
}

impl Timestamp {
    pub const NULL: Timestamp = Timestamp { secs: 0, inc: 0 };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Rebuild a timestamp from its packed 64-bit form
    pub fn from_u64(packed: u64) -> Self {
        Self {
            secs: (packed >> 32) as u32,
            inc: packed as u32,
        }
    }

    /// Pack into a single integer that preserves ordering
    pub fn as_u64(&self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    pub fn secs(&self) -> u32 {
        self.secs
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Null timestamps collapse to `None`
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_seconds_then_increment() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) > Timestamp::new(2, 0));
        assert_eq!(Timestamp::new(3, 3), Timestamp::new(3, 3));
    }

    #[test]
    fn test_packing_preserves_order() {
        let a = Timestamp::new(10, u32::MAX);
        let b = Timestamp::new(11, 0);
        assert!(a.as_u64() < b.as_u64());
        assert_eq!(Timestamp::from_u64(a.as_u64()), a);
    }

    #[test]
    fn test_null() {
        assert!(Timestamp::NULL.is_null());
        assert!(Timestamp::default().is_null());
        assert_eq!(Timestamp::NULL.non_null(), None);
        assert_eq!(Timestamp::new(0, 1).non_null(), Some(Timestamp::new(0, 1)));
    }
}
