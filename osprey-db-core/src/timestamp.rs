//! Logical timestamps.
//!
//! A `Timestamp` is a point in the replication log's logical clock. The
//! zero value is reserved as the null timestamp ("no timestamp assigned"),
//! matching how catalog writes distinguish replicated commits (non-null)
//! from local, storage-assigned ghost writes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical timestamp drawn from the replication log or the storage clock.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The null timestamp: no timestamp has been assigned.
    pub const NULL: Timestamp = Timestamp(0);

    /// Construct from a raw logical value.
    pub fn from_raw(raw: u64) -> Self {
        Timestamp(raw)
    }

    /// The raw logical value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// True when no timestamp has been assigned.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ts(null)")
        } else {
            write!(f, "ts({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_default_and_zero() {
        assert!(Timestamp::default().is_null());
        assert_eq!(Timestamp::NULL, Timestamp::from_raw(0));
    }

    #[test]
    fn ordering_follows_raw_value() {
        assert!(Timestamp::from_raw(1) < Timestamp::from_raw(2));
        assert!(Timestamp::NULL < Timestamp::from_raw(1));
    }
}
