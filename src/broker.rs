//! Broker-facing seams used by the failure-handling machinery
//!
//! The retry pipeline talks to the broker through these traits so that
//! every pause/resume/commit/seek decision can be exercised against mocks.
//! `src/kafka.rs` provides the rdkafka-backed implementations.

use crate::error::RetryResult;
use async_trait::async_trait;
use rdkafka::message::Message;
use std::fmt;

/// A topic/partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a topic/partition pair.
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// The partition a record was consumed from.
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self::new(message.topic(), message.partition())
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// How an offset commit is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until the broker confirms
    Sync,
    /// Fire and forget; failures are only logged
    Async,
}

/// A record to publish to the next destination.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Destination partition; None lets the broker assign one
    pub partition: Option<i32>,
    /// Record key
    pub key: Option<Vec<u8>>,
    /// Record payload
    pub payload: Option<Vec<u8>>,
    /// Record headers in write order
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Synchronous consumer controls needed during failure handling.
///
/// Committed offsets are "next to consume": handling a record at offset
/// `n` commits `n + 1`.
pub trait ConsumerOps: Send + Sync {
    /// Pauses delivery from the given partitions.
    fn pause(&self, partitions: &[TopicPartition]) -> RetryResult<()>;

    /// Resumes delivery from the given partitions.
    fn resume(&self, partitions: &[TopicPartition]) -> RetryResult<()>;

    /// Commits the given next-to-consume offsets.
    fn commit(&self, offsets: &[(TopicPartition, i64)], mode: CommitMode) -> RetryResult<()>;

    /// Moves the fetch position of one partition.
    fn seek(&self, partition: &TopicPartition, offset: i64) -> RetryResult<()>;

    /// Current partition assignment.
    fn assignment(&self) -> RetryResult<Vec<TopicPartition>>;

    /// Keepalive hook invoked while the worker intentionally sits idle.
    fn poll_idle(&self) {}
}

/// Publishes records to destination topics.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Sends one record and confirms the broker accepted it.
    async fn send(&self, record: OutboundRecord) -> RetryResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn topic_partition_display_and_identity() {
        let a = TopicPartition::new("orders", 2);
        assert_eq!(a.to_string(), "orders-2");

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(TopicPartition::new("orders", 2));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&a));
    }
}
