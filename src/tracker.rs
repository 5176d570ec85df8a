//! Per-record failure tracking for in-place redelivery
//!
//! Records are identified by topic, partition and offset, so a redelivered
//! record keeps accumulating against the same budget. Entries are dropped
//! once the record succeeds or is handed to recovery.

use crate::policy::RetryPolicy;
use dashmap::DashMap;
use rdkafka::message::{Message, OwnedMessage};
use std::time::Duration;
use tracing::debug;

type RecordKey = (String, i32, i64);

/// Tracks how often each record has failed and what the retry budget allows.
pub struct FailureTracker {
    attempts: DashMap<RecordKey, u32>,
    policy: RetryPolicy,
}

impl FailureTracker {
    /// Creates a tracker enforcing the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts: DashMap::new(),
            policy,
        }
    }

    /// The policy this tracker enforces.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn key(record: &OwnedMessage) -> RecordKey {
        (
            record.topic().to_string(),
            record.partition(),
            record.offset(),
        )
    }

    /// Counts one more failure for `record` and returns the total so far.
    pub fn record_failure(&self, record: &OwnedMessage) -> u32 {
        let mut entry = self.attempts.entry(Self::key(record)).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Failures recorded for `record` so far.
    pub fn failures(&self, record: &OwnedMessage) -> u32 {
        self.attempts
            .get(&Self::key(record))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Whether `record` still has redelivery budget left.
    ///
    /// A record that failed `n` times has used `n - 1` retries, so with
    /// `max_retries = 3` it is delivered four times in total before the
    /// tracker gives up on it.
    pub fn should_retry(&self, record: &OwnedMessage) -> bool {
        let failures = self.failures(record);
        self.policy.should_retry(failures.saturating_sub(1))
    }

    /// Backoff to apply before the next redelivery of `record`.
    pub fn next_backoff(&self, record: &OwnedMessage) -> Duration {
        self.policy.next_backoff(self.failures(record))
    }

    /// Forgets `record`, releasing its budget.
    pub fn clear(&self, record: &OwnedMessage) {
        self.attempts.remove(&Self::key(record));
    }

    /// Forgets every tracked record.
    pub fn clear_all(&self) {
        if !self.attempts.is_empty() {
            debug!(records = self.attempts.len(), "clearing failure tracker");
        }
        self.attempts.clear();
    }

    /// Whether any record is currently tracked.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
