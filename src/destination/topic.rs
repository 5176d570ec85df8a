//! Destination topic model
//!
//! A destination is one hop of a source topic's retry chain. Records that
//! keep failing move main → retry hops → dead letter; the no-op sentinel
//! terminates every chain so resolution always has somewhere to land.

use crate::error::FaultKind;
use std::collections::HashSet;
use std::fmt;

/// Role of a topic within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// The source topic records are first consumed from
    Main,
    /// A delayed retry hop
    Retry,
    /// Terminal parking topic for exhausted or fatal records
    DeadLetter,
    /// Sentinel meaning "stop, do not publish anywhere"
    NoOp,
}

/// One hop of a retry chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTopic {
    /// Topic name
    pub name: String,
    /// Source topic this chain belongs to
    pub source: String,
    /// Role within the chain
    pub kind: TopicKind,
    /// Delay before records in this topic become due
    pub delay_ms: u64,
    /// Position within the chain, main topic is 0
    pub position: usize,
    /// Total attempt budget of the chain
    pub max_attempts: i32,
    /// Overall cap on time since first delivery, when configured
    pub timeout_ms: Option<i64>,
    /// Republishing to the dead letter on dead-letter failures
    pub always_retry_on_dlt_failure: bool,
    /// Fault kinds this chain never retries
    pub no_retry_kinds: HashSet<FaultKind>,
    /// Partition count when known
    pub num_partitions: Option<i32>,
}

impl DestinationTopic {
    /// Whether this is the chain's source topic.
    pub fn is_main(&self) -> bool {
        self.kind == TopicKind::Main
    }

    /// Whether this is a delayed retry hop.
    pub fn is_retry(&self) -> bool {
        self.kind == TopicKind::Retry
    }

    /// Whether this is the dead-letter topic.
    pub fn is_dead_letter(&self) -> bool {
        self.kind == TopicKind::DeadLetter
    }

    /// Whether this is the terminal sentinel.
    pub fn is_no_op(&self) -> bool {
        self.kind == TopicKind::NoOp
    }

    /// Whether a record that failed here with the given kind still has
    /// retry budget.
    pub fn should_retry_on(&self, attempt: i32, kind: FaultKind) -> bool {
        attempt < self.max_attempts && !self.no_retry_kinds.contains(&kind)
    }
}

impl fmt::Display for DestinationTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
