//! Offset Tracker - decides which offsets of one partition may be committed
//!
//! Records of a partition are handled one at a time by that partition's
//! worker, so the tracker needs no locking: it is owned by the worker and
//! dropped with it when the partition is revoked.
//!
//! The committed cursor only ever moves forward. Under `CommitPolicy::Contiguous`
//! the first failure freezes it, so every record from the failed one onwards
//! is redelivered after a restart.

use tracing::debug;

use crate::config::CommitPolicy;
use crate::kafka::types::Partition;

/// What to do after a record was handled successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Commit this cursor (the record's offset + 1)
    Commit(i64),
    /// A cursor at or beyond this one was already committed
    AlreadyCovered,
    /// An earlier record on this partition failed
    Withheld { failed_offset: i64 },
}

pub struct OffsetTracker {
    partition: Partition,
    policy: CommitPolicy,
    /// Highest cursor confirmed by the broker
    committed: Option<i64>,
    /// First offset whose handler failed
    first_failure: Option<i64>,
}

impl OffsetTracker {
    pub fn new(partition: Partition, policy: CommitPolicy) -> Self {
        Self {
            partition,
            policy,
            committed: None,
            first_failure: None,
        }
    }

    pub fn decide(&self, offset: i64) -> CommitDecision {
        let cursor = offset + 1;

        if let (CommitPolicy::Contiguous, Some(failed_offset)) = (self.policy, self.first_failure) {
            if failed_offset < cursor {
                return CommitDecision::Withheld { failed_offset };
            }
        }

        match self.committed {
            Some(committed) if committed >= cursor => CommitDecision::AlreadyCovered,
            _ => CommitDecision::Commit(cursor),
        }
    }

    pub fn mark_committed(&mut self, cursor: i64) {
        if self.committed.map_or(true, |committed| cursor > committed) {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                previous = ?self.committed,
                cursor = cursor,
                "Advancing committed offset"
            );
            self.committed = Some(cursor);
        }
    }

    pub fn mark_failed(&mut self, offset: i64) {
        if self.first_failure.map_or(true, |failed| offset < failed) {
            self.first_failure = Some(offset);
        }
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    pub fn first_failure(&self) -> Option<i64> {
        self.first_failure
    }
}
