//! rdkafka-backed broker plumbing
//!
//! Implements the [`ConsumerOps`] and [`RecordPublisher`] seams on top of
//! rdkafka's `StreamConsumer` and `FutureProducer`, and owns client
//! construction, including the allow-list for tuning properties.

use crate::broker::{CommitMode, ConsumerOps, OutboundRecord, RecordPublisher, TopicPartition};
use crate::config::ConsumerConfig;
use crate::error::{RetryError, RetryResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode as KafkaCommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

/// How long a seek may block waiting for the fetcher.
const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka properties users may pass through [`ConsumerConfig::kafka_properties`].
const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Compression settings
    "compression.type",
    "compression.level",
    // Fetch settings
    "fetch.min.bytes",
    "fetch.max.wait.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    "receive.buffer.bytes",
    "send.buffer.bytes",
    // Consumer settings
    "queued.min.messages",
    "queued.max.messages.kbytes",
    "fetch.error.backoff.ms",
    "fetch.message.max.bytes",
    // Performance settings
    "enable.idempotence",
    "message.max.bytes",
    // Connection settings
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    // Monitoring
    "statistics.interval.ms",
    "enable.metrics.push",
];

/// Creates a stream consumer subscribed to `topics`.
///
/// Auto-commit is always off: offsets are owed to the failure-handling
/// machinery, which commits only past records it has fully resolved.
pub async fn create_stream_consumer(
    config: &ConsumerConfig,
    topics: &[String],
) -> RetryResult<StreamConsumer> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set(
            "max.poll.interval.ms",
            config.max_poll_interval_ms.to_string(),
        )
        .set("auto.offset.reset", &config.auto_offset_reset);

    // Add custom properties with validation
    for (key, value) in &config.kafka_properties {
        if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
            return Err(RetryError::Config(format!(
                "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                key, ALLOWED_KAFKA_PROPS
            )));
        }
        client_config.set(key, value);
    }

    let consumer: StreamConsumer = client_config
        .create()
        .map_err(|e| RetryError::Config(format!("Failed to create consumer: {}", e)))?;

    // Subscribe with timeout
    let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
    tokio::time::timeout(config.connection_timeout, async {
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| RetryError::Config(format!("Failed to subscribe: {}", e)))
    })
    .await
    .map_err(|_| RetryError::Config("Subscription timeout".to_string()))??;

    info!("Subscribed to topics: {:?}", topics);
    Ok(consumer)
}

/// Creates the producer used to publish records to retry and dead-letter
/// topics.
pub fn create_producer(config: &ConsumerConfig) -> RetryResult<FutureProducer> {
    let mut producer_config = ClientConfig::new();
    producer_config
        .set("bootstrap.servers", &config.brokers)
        .set("message.timeout.ms", "30000");

    producer_config
        .create()
        .map_err(|e| RetryError::Config(format!("Failed to create producer: {}", e)))
}

fn to_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        list.add_partition(&partition.topic, partition.partition);
    }
    list
}

impl<C, R> ConsumerOps for StreamConsumer<C, R>
where
    C: ConsumerContext + 'static,
    R: Send + Sync,
{
    fn pause(&self, partitions: &[TopicPartition]) -> RetryResult<()> {
        Consumer::pause(self, &to_list(partitions))?;
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> RetryResult<()> {
        Consumer::resume(self, &to_list(partitions))?;
        Ok(())
    }

    fn commit(&self, offsets: &[(TopicPartition, i64)], mode: CommitMode) -> RetryResult<()> {
        let mut list = TopicPartitionList::with_capacity(offsets.len());
        for (partition, offset) in offsets {
            list.add_partition_offset(
                &partition.topic,
                partition.partition,
                Offset::Offset(*offset),
            )?;
        }
        let mode = match mode {
            CommitMode::Sync => KafkaCommitMode::Sync,
            CommitMode::Async => KafkaCommitMode::Async,
        };
        Consumer::commit(self, &list, mode)?;
        Ok(())
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> RetryResult<()> {
        Consumer::seek(
            self,
            &partition.topic,
            partition.partition,
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }

    fn assignment(&self) -> RetryResult<Vec<TopicPartition>> {
        let assigned = Consumer::assignment(self)?;
        Ok(assigned
            .elements()
            .iter()
            .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
            .collect())
    }

    fn poll_idle(&self) {
        // librdkafka keeps the group membership alive from its background
        // thread, so no explicit poll is needed while the worker sleeps.
    }
}

/// Publishes outbound records through a shared `FutureProducer`.
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Wraps a producer with a per-send confirmation timeout.
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl RecordPublisher for KafkaPublisher {
    async fn send(&self, record: OutboundRecord) -> RetryResult<()> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_slice()),
            });
        }

        let mut outbound: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(&record.topic).headers(headers);
        if let Some(partition) = record.partition {
            outbound = outbound.partition(partition);
        }
        if let Some(key) = record.key.as_ref() {
            outbound = outbound.key(key);
        }
        if let Some(payload) = record.payload.as_ref() {
            outbound = outbound.payload(payload);
        }

        match self.producer.send(outbound, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %record.topic,
                    partition,
                    offset,
                    "published record"
                );
                Ok(())
            }
            Err((error, _)) => Err(RetryError::PublishNotConfirmed {
                topic: record.topic,
                reason: error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disallowed_kafka_property_is_rejected() {
        let config = ConsumerConfig::builder()
            .kafka_property("auto.commit.interval.ms", "1000")
            .build();

        let err = create_stream_consumer(&config, &["orders".to_string()])
            .await
            .err()
            .unwrap();
        match err {
            RetryError::Config(message) => {
                assert!(message.contains("Disallowed Kafka property"));
                assert!(message.contains("auto.commit.interval.ms"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
