//! Consumer and retry-chain configuration structures

use crate::error::FaultKind;
use crate::policy::{DelayPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How retry hop topics are suffixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuffixStyle {
    /// `<source><retry-suffix>-<cumulative delay ms>`
    DelayValue,
    /// `<source><retry-suffix>-<zero-based hop index>`
    Index,
}

/// What happens when handling a dead-lettered record fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DltPolicy {
    /// No dead-letter topic: exhausted records stop at the no-op sentinel
    None,
    /// Dead-letter processing failures end the chain
    FailOnError,
    /// Dead-letter processing failures republish to the dead-letter topic,
    /// unless the fault is fatal
    AlwaysRetryOnError,
}

/// What happens when forwarding to the next hop cannot be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailurePolicy {
    /// Leave the offset uncommitted and seek back so the forward is retried
    Redeliver,
    /// Propagate the error and stop the worker
    Fail,
}

/// Kafka consumer transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Consumer group ID
    pub group_id: String,

    /// Source topics whose retry chains this worker serves
    pub source_topics: Vec<String>,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Maximum poll interval in milliseconds
    pub max_poll_interval_ms: u32,

    /// Offset reset policy (earliest, latest, none)
    pub auto_offset_reset: String,

    /// Maximum records per delivered batch
    pub batch_size: usize,

    /// Processing timeout per record
    pub processing_timeout: Duration,

    /// Connection timeout for initial consumer creation
    pub connection_timeout: Duration,

    /// Network operation timeout for ongoing operations
    pub network_timeout: Duration,

    /// Batch collection window
    pub batch_timeout: Duration,

    /// Deliver batches to the handler instead of single records
    pub enable_batching: bool,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "retry-consumer".to_string(),
            source_topics: vec!["events".to_string()],
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            // Retry hop topics are short-lived; a fresh group must not skip
            // records that were forwarded before it first joined.
            auto_offset_reset: "earliest".to_string(),
            batch_size: 100,
            processing_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
            network_timeout: Duration::from_secs(10),
            batch_timeout: Duration::from_millis(100),
            enable_batching: false,
            kafka_properties: HashMap::new(),
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.brokers = brokers.into();
        self
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    /// Set the source topics
    pub fn source_topics(mut self, topics: Vec<String>) -> Self {
        self.config.source_topics = topics;
        self
    }

    /// Add a single source topic
    pub fn source_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.source_topics.push(topic.into());
        self
    }

    /// Set the session timeout
    pub fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.config.session_timeout_ms = timeout;
        self
    }

    /// Set the offset reset policy
    pub fn auto_offset_reset(mut self, reset: impl Into<String>) -> Self {
        self.config.auto_offset_reset = reset.into();
        self
    }

    /// Set the maximum batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the per-record processing timeout
    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.config.processing_timeout = timeout;
        self
    }

    /// Set the batch collection window
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    /// Enable batch delivery
    pub fn enable_batching(mut self, enable: bool) -> Self {
        self.config.enable_batching = enable;
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.kafka_properties.insert(key.into(), value.into());
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id.is_empty() {
            return Err("Group ID cannot be empty".to_string());
        }

        if self.source_topics.is_empty() {
            return Err("Source topics cannot be empty".to_string());
        }

        if self.source_topics.iter().any(|t| t.is_empty()) {
            return Err("Source topic names cannot be empty".to_string());
        }

        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest" | "none") {
            return Err(format!(
                "Invalid auto_offset_reset '{}': expected earliest, latest or none",
                self.auto_offset_reset
            ));
        }

        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }

        if self.batch_timeout.is_zero() {
            return Err("Batch timeout must be greater than 0".to_string());
        }

        if self.processing_timeout.is_zero() {
            return Err("Processing timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Retry chain configuration shared by every source topic a worker serves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTopicConfig {
    /// Total delivery attempts across the chain, first delivery included
    pub max_attempts: i32,

    /// Per-hop delay schedule
    pub delay: DelayPolicy,

    /// Suffix marking retry hop topics
    pub retry_suffix: String,

    /// Suffix marking the dead-letter topic
    pub dlt_suffix: String,

    /// How retry hop topics are numbered
    pub suffix_style: SuffixStyle,

    /// Overall cap on time since first delivery; None disables the cap
    pub timeout: Option<Duration>,

    /// Dead-letter behavior
    pub dlt_policy: DltPolicy,

    /// Append fresh original-record headers on every hop instead of
    /// capturing them once
    pub append_original_headers: bool,

    /// Replace previously recorded exception headers instead of
    /// accumulating them
    pub strip_previous_exception_headers: bool,

    /// Commit offsets synchronously during failure handling
    pub sync_commits: bool,

    /// On a mid-batch failure, seek back and redeliver instead of
    /// recovering in place
    pub seek_after_error: bool,

    /// How often paused partitions are re-checked; None derives it from the
    /// smallest hop delay
    pub wake_interval: Option<Duration>,

    /// Partition count of the chain topics when known
    pub num_partitions: Option<i32>,

    /// Fault kinds never retried for these chains, on top of the
    /// classifier's fatal set
    pub no_retry_kinds: Vec<FaultKind>,

    /// What to do when a forward cannot be confirmed
    pub publish_failure_policy: PublishFailurePolicy,

    /// In-place retries before the first topic hop
    pub blocking_retry: RetryPolicy,

    /// Subscribe to the dead-letter topic as well
    pub process_dlt: bool,
}

impl Default for RetryTopicConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: DelayPolicy::default(),
            retry_suffix: "-retry".to_string(),
            dlt_suffix: "-dlt".to_string(),
            suffix_style: SuffixStyle::DelayValue,
            timeout: None,
            dlt_policy: DltPolicy::FailOnError,
            append_original_headers: false,
            strip_previous_exception_headers: true,
            sync_commits: true,
            seek_after_error: false,
            wake_interval: None,
            num_partitions: None,
            no_retry_kinds: Vec::new(),
            publish_failure_policy: PublishFailurePolicy::Redeliver,
            blocking_retry: RetryPolicy::no_retry(),
            process_dlt: false,
        }
    }
}

/// Builder for RetryTopicConfig
pub struct RetryTopicConfigBuilder {
    config: RetryTopicConfig,
}

impl RetryTopicConfigBuilder {
    /// Create a new retry topic config builder
    pub fn new() -> Self {
        Self {
            config: RetryTopicConfig::default(),
        }
    }

    /// Set the total attempt budget
    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the per-hop delay schedule
    pub fn delay(mut self, delay: DelayPolicy) -> Self {
        self.config.delay = delay;
        self
    }

    /// Set a fixed delay for every hop
    pub fn fixed_delay(mut self, delay: Duration) -> Self {
        self.config.delay = DelayPolicy::Fixed { delay };
        self
    }

    /// Set an exponential delay schedule
    pub fn exponential_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.config.delay = DelayPolicy::exponential(initial, max);
        self
    }

    /// Set the retry topic suffix
    pub fn retry_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.retry_suffix = suffix.into();
        self
    }

    /// Set the dead-letter topic suffix
    pub fn dlt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.dlt_suffix = suffix.into();
        self
    }

    /// Set the hop numbering style
    pub fn suffix_style(mut self, style: SuffixStyle) -> Self {
        self.config.suffix_style = style;
        self
    }

    /// Cap the total time since first delivery
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set the dead-letter behavior
    pub fn dlt_policy(mut self, policy: DltPolicy) -> Self {
        self.config.dlt_policy = policy;
        self
    }

    /// Append original-record headers on every hop
    pub fn append_original_headers(mut self, append: bool) -> Self {
        self.config.append_original_headers = append;
        self
    }

    /// Accumulate exception headers across hops
    pub fn strip_previous_exception_headers(mut self, strip: bool) -> Self {
        self.config.strip_previous_exception_headers = strip;
        self
    }

    /// Commit offsets synchronously during failure handling
    pub fn sync_commits(mut self, sync: bool) -> Self {
        self.config.sync_commits = sync;
        self
    }

    /// Seek back and redeliver on mid-batch failures
    pub fn seek_after_error(mut self, seek: bool) -> Self {
        self.config.seek_after_error = seek;
        self
    }

    /// Set the paused-partition wake interval
    pub fn wake_interval(mut self, interval: Duration) -> Self {
        self.config.wake_interval = Some(interval);
        self
    }

    /// Declare the partition count of the chain topics
    pub fn num_partitions(mut self, partitions: i32) -> Self {
        self.config.num_partitions = Some(partitions);
        self
    }

    /// Add a fault kind that is never retried on these chains
    pub fn no_retry_on(mut self, kind: FaultKind) -> Self {
        self.config.no_retry_kinds.push(kind);
        self
    }

    /// Set the publish failure policy
    pub fn publish_failure_policy(mut self, policy: PublishFailurePolicy) -> Self {
        self.config.publish_failure_policy = policy;
        self
    }

    /// Set the in-place retry policy applied before the first hop
    pub fn blocking_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.blocking_retry = policy;
        self
    }

    /// Subscribe to the dead-letter topic as well
    pub fn process_dlt(mut self, process: bool) -> Self {
        self.config.process_dlt = process;
        self
    }

    /// Build the retry topic configuration
    pub fn build(self) -> RetryTopicConfig {
        self.config
    }
}

impl Default for RetryTopicConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

impl RetryTopicConfig {
    /// Create a new retry topic config builder
    pub fn builder() -> RetryTopicConfigBuilder {
        RetryTopicConfigBuilder::new()
    }

    /// Number of retry hops in each chain.
    pub fn retry_hops(&self) -> usize {
        (self.max_attempts.max(1) - 1) as usize
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be at least 1".to_string());
        }

        if !is_valid_suffix(&self.retry_suffix) {
            return Err(format!(
                "Invalid retry suffix '{}': must be non-empty [a-zA-Z0-9._-]",
                self.retry_suffix
            ));
        }

        if !is_valid_suffix(&self.dlt_suffix) {
            return Err(format!(
                "Invalid dead-letter suffix '{}': must be non-empty [a-zA-Z0-9._-]",
                self.dlt_suffix
            ));
        }

        if self.retry_suffix == self.dlt_suffix {
            return Err("Retry and dead-letter suffixes must differ".to_string());
        }

        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err("Timeout must be greater than 0 when set".to_string());
        }

        if matches!(self.wake_interval, Some(t) if t.is_zero()) {
            return Err("Wake interval must be greater than 0 when set".to_string());
        }

        if matches!(self.num_partitions, Some(n) if n < 1) {
            return Err("num_partitions must be at least 1 when set".to_string());
        }

        if self.process_dlt && self.dlt_policy == DltPolicy::None {
            return Err("Cannot process a dead-letter topic when dlt_policy is none".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_configs_validate() {
        assert_eq!(ConsumerConfig::default().validate(), Ok(()));
        assert_eq!(RetryTopicConfig::default().validate(), Ok(()));
    }

    #[test]
    fn consumer_builder_sets_fields() {
        let config = ConsumerConfig::builder()
            .brokers("broker-1:9092,broker-2:9092")
            .group_id("orders-workers")
            .source_topics(vec!["orders".to_string()])
            .batch_size(50)
            .enable_batching(true)
            .kafka_property("fetch.min.bytes", "1024")
            .build();

        assert_eq!(config.brokers, "broker-1:9092,broker-2:9092");
        assert_eq!(config.group_id, "orders-workers");
        assert_eq!(config.source_topics, vec!["orders".to_string()]);
        assert_eq!(config.batch_size, 50);
        assert!(config.enable_batching);
        assert_eq!(
            config.kafka_properties.get("fetch.min.bytes"),
            Some(&"1024".to_string())
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn consumer_config_rejects_bad_values() {
        let mut config = ConsumerConfig::default();
        config.brokers = String::new();
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::default();
        config.source_topics.clear();
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::default();
        config.auto_offset_reset = "sometimes".to_string();
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_builder_sets_fields() {
        let config = RetryTopicConfig::builder()
            .max_attempts(4)
            .exponential_delay(Duration::from_secs(1), Duration::from_secs(8))
            .retry_suffix("-again")
            .dlt_suffix("-graveyard")
            .suffix_style(SuffixStyle::Index)
            .timeout(Duration::from_secs(600))
            .dlt_policy(DltPolicy::AlwaysRetryOnError)
            .no_retry_on(FaultKind::Timeout)
            .num_partitions(6)
            .build();

        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.retry_hops(), 3);
        assert_eq!(config.retry_suffix, "-again");
        assert_eq!(config.dlt_suffix, "-graveyard");
        assert_eq!(config.suffix_style, SuffixStyle::Index);
        assert_eq!(config.timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.dlt_policy, DltPolicy::AlwaysRetryOnError);
        assert_eq!(config.no_retry_kinds, vec![FaultKind::Timeout]);
        assert_eq!(config.num_partitions, Some(6));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn retry_config_rejects_bad_values() {
        let config = RetryTopicConfig::builder().max_attempts(0).build();
        assert!(config.validate().is_err());

        let config = RetryTopicConfig::builder().retry_suffix("").build();
        assert!(config.validate().is_err());

        let config = RetryTopicConfig::builder().retry_suffix("has space").build();
        assert!(config.validate().is_err());

        let config = RetryTopicConfig::builder()
            .retry_suffix("-x")
            .dlt_suffix("-x")
            .build();
        assert!(config.validate().is_err());

        let config = RetryTopicConfig::builder()
            .dlt_policy(DltPolicy::None)
            .process_dlt(true)
            .build();
        assert!(config.validate().is_err());

        let config = RetryTopicConfig::builder().num_partitions(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_config_deserializes_from_json() {
        let json = r#"
        {
            "max_attempts": 5,
            "delay": {"type": "fixed", "delay": {"secs": 2, "nanos": 0}},
            "retry_suffix": "-retry",
            "dlt_suffix": "-dlt",
            "suffix_style": "index",
            "timeout": {"secs": 300, "nanos": 0},
            "dlt_policy": "always_retry_on_error",
            "append_original_headers": false,
            "strip_previous_exception_headers": true,
            "sync_commits": true,
            "seek_after_error": false,
            "wake_interval": null,
            "num_partitions": 3,
            "no_retry_kinds": ["Downcast"],
            "publish_failure_policy": "redeliver",
            "blocking_retry": {
                "max_retries": 0,
                "initial_backoff": {"secs": 0, "nanos": 100000000},
                "max_backoff": {"secs": 30, "nanos": 0},
                "backoff_multiplier": 2.0,
                "jitter_factor": 0.1,
                "exponential": true
            },
            "process_dlt": false
        }"#;

        let config: RetryTopicConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.suffix_style, SuffixStyle::Index);
        assert_eq!(config.dlt_policy, DltPolicy::AlwaysRetryOnError);
        assert_eq!(config.no_retry_kinds, vec![FaultKind::Downcast]);
        assert_eq!(config.validate(), Ok(()));
    }
}
