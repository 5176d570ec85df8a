//! Non-blocking retry and dead-letter routing for Kafka consumers
//!
//! Failed records are republished to per-delay retry topics instead of
//! blocking the consumer. Each hop carries its provenance in headers
//! (attempt count, original coordinates, failure cause), waits out its
//! backoff behind a paused partition, and lands in the dead-letter topic
//! once the attempt budget runs out or a fatal fault short-circuits the
//! chain. State rides entirely on the records, so workers scale out
//! without coordination.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use rdkafka::message::{Message, OwnedMessage};
//! use retry_topics::{
//!     ConsumerConfig, Fault, RecordHandler, RetryConsumer, RetryTopicConfig,
//! };
//! use std::time::Duration;
//!
//! struct OrderHandler;
//!
//! #[async_trait]
//! impl RecordHandler for OrderHandler {
//!     async fn handle(&self, record: &OwnedMessage) -> Result<(), Fault> {
//!         let payload = record
//!             .payload()
//!             .ok_or_else(|| Fault::PayloadExtraction("empty order record".to_string()))?;
//!         let _order: serde_json::Value = serde_json::from_slice(payload)
//!             .map_err(|e| Fault::Deserialization(e.to_string()))?;
//!         // ... apply the order ...
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let consumer_config = ConsumerConfig::builder()
//!     .brokers("localhost:9092")
//!     .group_id("orders-processor")
//!     .source_topics(vec!["orders".to_string()])
//!     .build();
//!
//! let retry_config = RetryTopicConfig::builder()
//!     .max_attempts(4)
//!     .fixed_delay(Duration::from_secs(2))
//!     .build();
//!
//! let consumer = RetryConsumer::new(consumer_config, retry_config, OrderHandler).await?;
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

// Re-export commonly used items
pub use broker::{CommitMode, ConsumerOps, OutboundRecord, RecordPublisher, TopicPartition};
pub use classify::FaultClassifier;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConsumerConfig, DltPolicy, PublishFailurePolicy, RetryTopicConfig, SuffixStyle};
pub use error::{Fault, FaultKind, RetryError, RetryResult};
pub use listener::{RecordHandler, RetryConsumer};
pub use policy::{DelayPolicy, RetryPolicy};
pub use recovery::{RecordRecoverer, RecoveryOutcome, RecoveryPublisher};
pub use router::{DelegatingFaultRouter, Disposition, FaultStrategy};

/// Partition backoff gating
pub mod backoff;

/// Batch failure handling
pub mod batch;

/// Broker-facing traits and record types
pub mod broker;

/// Fatal/retryable fault classification
pub mod classify;

/// Injected time source
pub mod clock;

/// Consumer and retry-chain configuration
pub mod config;

/// Destination chains and resolution
pub mod destination;

/// Fault and error types
pub mod error;

/// Provenance header names and codecs
pub mod headers;

/// rdkafka-backed clients
pub mod kafka;

/// The consumer worker
pub mod listener;

/// Delay schedules and blocking-retry policies
pub mod policy;

/// Forwarding failed records to their next hop
pub mod recovery;

/// Fault-to-strategy routing
pub mod router;

/// Graceful shutdown tracking
pub mod shutdown;

/// In-memory doubles for the broker seams
pub mod testing;

/// Per-record failure counting for blocking retries
pub mod tracker;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
