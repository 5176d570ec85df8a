//! Test doubles for the broker seams
//!
//! Public on purpose: downstream crates exercise their retry wiring against
//! these mocks instead of a live broker, the same way this crate's own test
//! suite does.

use crate::broker::{CommitMode, ConsumerOps, OutboundRecord, RecordPublisher, TopicPartition};
use crate::error::{Fault, RetryError, RetryResult};
use crate::recovery::RecordRecoverer;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders, OwnedMessage, Timestamp};
use rdkafka::types::RDKafkaErrorCode;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Base timestamp of records built by [`record`].
pub const BASE_TIMESTAMP_MS: i64 = 1_600_000_000_000;

/// One recorded consumer interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerCall {
    /// Partitions paused
    Pause(Vec<TopicPartition>),
    /// Partitions resumed
    Resume(Vec<TopicPartition>),
    /// Offsets committed
    Commit(Vec<(TopicPartition, i64)>, CommitMode),
    /// Fetch position moved
    Seek(TopicPartition, i64),
    /// Idle keepalive poll
    PollIdle,
    /// Assignment queried
    Assignment,
}

/// Consumer mock recording every interaction in order.
#[derive(Default)]
pub struct MockConsumer {
    calls: Mutex<Vec<ConsumerCall>>,
    assignment: Mutex<Vec<TopicPartition>>,
    fail_commits: AtomicBool,
}

impl MockConsumer {
    /// Mock with an empty assignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock reporting the given assignment.
    pub fn with_assignment(partitions: Vec<TopicPartition>) -> Self {
        let mock = Self::default();
        *mock.assignment.lock() = partitions;
        mock
    }

    /// Replaces the reported assignment.
    pub fn set_assignment(&self, partitions: Vec<TopicPartition>) {
        *self.assignment.lock() = partitions;
    }

    /// Makes subsequent commits fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Every interaction so far, in order.
    pub fn calls(&self) -> Vec<ConsumerCall> {
        self.calls.lock().clone()
    }

    /// Seeks so far, in order.
    pub fn seeks(&self) -> Vec<(TopicPartition, i64)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ConsumerCall::Seek(tp, offset) => Some((tp.clone(), *offset)),
                _ => None,
            })
            .collect()
    }

    /// Committed next-to-consume offsets so far, flattened in order.
    pub fn committed(&self) -> Vec<(TopicPartition, i64)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ConsumerCall::Commit(offsets, _) => Some(offsets.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn push(&self, call: ConsumerCall) {
        self.calls.lock().push(call);
    }
}

impl ConsumerOps for MockConsumer {
    fn pause(&self, partitions: &[TopicPartition]) -> RetryResult<()> {
        self.push(ConsumerCall::Pause(partitions.to_vec()));
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> RetryResult<()> {
        self.push(ConsumerCall::Resume(partitions.to_vec()));
        Ok(())
    }

    fn commit(&self, offsets: &[(TopicPartition, i64)], mode: CommitMode) -> RetryResult<()> {
        self.push(ConsumerCall::Commit(offsets.to_vec(), mode));
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(RetryError::Kafka(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::OperationTimedOut,
            )));
        }
        Ok(())
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> RetryResult<()> {
        self.push(ConsumerCall::Seek(partition.clone(), offset));
        Ok(())
    }

    fn assignment(&self) -> RetryResult<Vec<TopicPartition>> {
        self.push(ConsumerCall::Assignment);
        Ok(self.assignment.lock().clone())
    }

    fn poll_idle(&self) {
        self.push(ConsumerCall::PollIdle);
    }
}

/// Publisher mock capturing sent records.
#[derive(Default)]
pub struct CapturingPublisher {
    sent: Mutex<Vec<OutboundRecord>>,
    fail_remaining: AtomicUsize,
    fail_all: AtomicBool,
}

impl CapturingPublisher {
    /// Publisher that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` sends fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Makes every send fail.
    pub fn fail_always(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Records accepted so far.
    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.sent.lock().clone()
    }

    fn take_failure(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        let mut failed = false;
        let _ = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    failed = true;
                    Some(n - 1)
                } else {
                    None
                }
            });
        failed
    }
}

#[async_trait]
impl RecordPublisher for CapturingPublisher {
    async fn send(&self, record: OutboundRecord) -> RetryResult<()> {
        if self.take_failure() {
            return Err(RetryError::PublishNotConfirmed {
                topic: record.topic,
                reason: "delivery timed out".to_string(),
            });
        }
        self.sent.lock().push(record);
        Ok(())
    }
}

/// Recoverer mock recording which records it was handed.
#[derive(Default)]
pub struct RecordingRecoverer {
    recovered: Mutex<Vec<(String, i32, i64)>>,
    fail_offsets: Mutex<HashSet<i64>>,
    fail_all: AtomicBool,
}

impl RecordingRecoverer {
    /// Recoverer that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes recovery of the record at the given offset fail.
    pub fn fail_offset(&self, offset: i64) {
        self.fail_offsets.lock().insert(offset);
    }

    /// Makes every recovery fail.
    pub fn fail_always(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// (topic, partition, offset) of every recovered record, in order.
    pub fn recovered(&self) -> Vec<(String, i32, i64)> {
        self.recovered.lock().clone()
    }
}

#[async_trait]
impl RecordRecoverer for RecordingRecoverer {
    async fn recover(&self, record: &OwnedMessage, _fault: &Fault) -> RetryResult<()> {
        if self.fail_all.load(Ordering::SeqCst)
            || self.fail_offsets.lock().contains(&record.offset())
        {
            return Err(RetryError::PublishNotConfirmed {
                topic: record.topic().to_string(),
                reason: "forced recovery failure".to_string(),
            });
        }
        self.recovered.lock().push((
            record.topic().to_string(),
            record.partition(),
            record.offset(),
        ));
        Ok(())
    }
}

/// Builds a consumed record with a deterministic timestamp and key.
pub fn record(topic: &str, partition: i32, offset: i64, payload: &[u8]) -> OwnedMessage {
    record_with_headers(topic, partition, offset, payload, &[])
}

/// Builds a consumed record carrying the given headers.
pub fn record_with_headers(
    topic: &str,
    partition: i32,
    offset: i64,
    payload: &[u8],
    headers: &[(&str, Vec<u8>)],
) -> OwnedMessage {
    let owned = if headers.is_empty() {
        None
    } else {
        let mut owned = OwnedHeaders::new();
        for (key, value) in headers {
            owned = owned.insert(Header {
                key,
                value: Some(&value[..]),
            });
        }
        Some(owned)
    };
    OwnedMessage::new(
        Some(payload.to_vec()),
        Some(format!("key-{offset}").into_bytes()),
        topic.to_string(),
        Timestamp::CreateTime(BASE_TIMESTAMP_MS + offset),
        partition,
        offset,
        owned,
    )
}
