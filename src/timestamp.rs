//! Oplog timestamps and their integer encoding.
//!
//! A replica set orders its oplog by a `(time, increment)` pair. The
//! replicator needs a single integer for comparisons, for the `_ts` field
//! written on every replicated document and for the progress ledger, so the
//! pair is packed into a `u64` with `time` in the high 32 bits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Native oplog timestamp: seconds since the epoch plus an ordinal within
/// that second.
///
/// Ordering is `(time, increment)`, which matches the ordering of the
/// encoded integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "t")]
    pub time: u32,
    #[serde(rename = "i")]
    pub increment: u32,
}

impl Timestamp {
    pub const fn new(time: u32, increment: u32) -> Self {
        Self { time, increment }
    }

    /// Packs the timestamp into its integer representation.
    ///
    /// ```rust
    /// use oplog_replicator::Timestamp;
    ///
    /// let ts = Timestamp::new(1, 2);
    /// assert_eq!(ts.as_u64(), (1 << 32) + 2);
    /// assert_eq!(Timestamp::from_u64(ts.as_u64()), ts);
    /// ```
    pub const fn as_u64(self) -> u64 {
        ((self.time as u64) << 32) | self.increment as u64
    }

    pub const fn from_u64(value: u64) -> Self {
        Self {
            time: (value >> 32) as u32,
            increment: (value & 0xFFFF_FFFF) as u32,
        }
    }

    /// Wall-clock seconds between two timestamps, zero if `earlier` is not
    /// actually earlier.
    pub fn seconds_since(self, earlier: Timestamp) -> u64 {
        u64::from(self.time.saturating_sub(earlier.time))
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.as_u64()
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Timestamp::from_u64(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.time, self.increment)
    }
}
