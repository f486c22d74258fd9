//! In-memory cursor bookmark of a single worker.
//!
//! The checkpoint holds the timestamp of the last oplog entry known to be
//! fully applied to the target store. It is owned by exactly one worker and
//! only moves forward, except when rollback recovery rewinds it to the
//! common point of the old and new histories.

use crate::Timestamp;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last fully applied timestamp; `None` before anything was applied.
    pub commit_ts: Option<Timestamp>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(commit_ts: Timestamp) -> Self {
        Self {
            commit_ts: Some(commit_ts),
        }
    }

    /// Records that the entry at `ts` was applied. Older timestamps are
    /// ignored; returns whether the checkpoint moved.
    pub fn advance(&mut self, ts: Timestamp) -> bool {
        match self.commit_ts {
            Some(current) if current >= ts => false,
            _ => {
                self.commit_ts = Some(ts);
                true
            }
        }
    }

    /// Unconditionally repositions the checkpoint. Used when a new cursor is
    /// negotiated and by rollback recovery.
    pub fn reset(&mut self, commit_ts: Option<Timestamp>) {
        self.commit_ts = commit_ts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let mut checkpoint = Checkpoint::new();
        assert_eq!(checkpoint.commit_ts, None);

        assert!(checkpoint.advance(Timestamp::new(10, 1)));
        assert!(checkpoint.advance(Timestamp::new(10, 2)));
        assert!(!checkpoint.advance(Timestamp::new(10, 2)));
        assert!(!checkpoint.advance(Timestamp::new(9, 9)));
        assert_eq!(checkpoint.commit_ts, Some(Timestamp::new(10, 2)));
    }

    #[test]
    fn test_reset_can_rewind() {
        let mut checkpoint = Checkpoint::at(Timestamp::new(10, 5));
        checkpoint.reset(Some(Timestamp::new(10, 1)));
        assert_eq!(checkpoint.commit_ts, Some(Timestamp::new(10, 1)));

        checkpoint.reset(None);
        assert_eq!(checkpoint, Checkpoint::new());
    }
}
