//! Record recovery: resolve the next destination and forward the record
//!
//! `RecoveryPublisher` is the write side of the retry chain. Given a failed
//! record and its fault it resolves the destination, rebuilds the header
//! blocks (bookkeeping replaced, provenance captured, exception info
//! refreshed) and publishes. Nothing is ever published for the no-op
//! sentinel.

use crate::broker::{OutboundRecord, RecordPublisher};
use crate::clock::Clock;
use crate::destination::resolver::DestinationResolver;
use crate::destination::topic::DestinationTopic;
use crate::error::{Fault, RetryError, RetryResult};
use crate::headers;
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use rdkafka::message::{Headers, Message, OwnedMessage};
use std::sync::Arc;
use tracing::debug;

/// What happened to a recovered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The record was forwarded
    Forwarded {
        /// Destination topic
        destination: String,
        /// Attempt count written to the forwarded record
        attempts: i32,
        /// Due time written to the forwarded record
        due_ms: i64,
    },
    /// The chain ended; nothing was published
    Halted,
}

/// Hands a failed record to the retry chain.
///
/// This is the seam the batch processor and the strategies escalate
/// through; [`RecoveryPublisher`] is the production implementation.
#[async_trait]
pub trait RecordRecoverer: Send + Sync {
    /// Recovers one failed record.
    async fn recover(&self, record: &OwnedMessage, fault: &Fault) -> RetryResult<()>;
}

/// Resolves destinations and publishes failed records to them.
pub struct RecoveryPublisher {
    resolver: Arc<DestinationResolver>,
    publisher: Arc<dyn RecordPublisher>,
    clock: Arc<dyn Clock>,
    group_id: Option<String>,
    append_original_headers: bool,
    strip_previous_exception_headers: bool,
}

impl RecoveryPublisher {
    /// Creates a publisher with default header behavior: originals captured
    /// once, exception headers replaced each hop.
    pub fn new(
        resolver: Arc<DestinationResolver>,
        publisher: Arc<dyn RecordPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver,
            publisher,
            clock,
            group_id: None,
            append_original_headers: false,
            strip_previous_exception_headers: true,
        }
    }

    /// Records the consumer group in the provenance headers.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Appends fresh original-record headers on every hop.
    pub fn with_append_original_headers(mut self, append: bool) -> Self {
        self.append_original_headers = append;
        self
    }

    /// Accumulates exception headers across hops instead of replacing them.
    pub fn with_strip_previous_exception_headers(mut self, strip: bool) -> Self {
        self.strip_previous_exception_headers = strip;
        self
    }

    /// Resolves the destination for `record` and forwards it.
    ///
    /// A backoff signal anywhere in the fault is passed through as
    /// [`RetryError::BackoffNotElapsed`]: the record was not due and must
    /// not consume retry budget.
    pub async fn forward(
        &self,
        record: &OwnedMessage,
        fault: &Fault,
    ) -> RetryResult<RecoveryOutcome> {
        if let Some(due_ms) = fault.backoff_due() {
            return Err(RetryError::BackoffNotElapsed { due_ms });
        }

        let attempts = headers::read_attempts(record);
        let now = self.clock.now_millis();
        let original_ts = headers::read_original_timestamp(record, now);

        let destination = self
            .resolver
            .resolve(record.topic(), attempts, fault, original_ts)?;
        if destination.is_no_op() {
            debug!(
                topic = record.topic(),
                offset = record.offset(),
                "chain ended, record not republished"
            );
            return Ok(RecoveryOutcome::Halted);
        }

        let failure_ts = fault.failure_timestamp().unwrap_or(now);
        let due_ms = failure_ts + destination.delay_ms as i64;

        let outbound = self.build_outbound(record, fault, &destination, attempts, original_ts, due_ms);
        self.publisher.send(outbound).await?;

        debug!(
            from = record.topic(),
            to = %destination,
            attempts = attempts + 1,
            due_ms,
            "record forwarded"
        );
        Ok(RecoveryOutcome::Forwarded {
            destination: destination.name.clone(),
            attempts: attempts + 1,
            due_ms,
        })
    }

    fn build_outbound(
        &self,
        record: &OwnedMessage,
        fault: &Fault,
        destination: &DestinationTopic,
        attempts: i32,
        original_ts: i64,
        due_ms: i64,
    ) -> OutboundRecord {
        let mut out = Vec::new();

        // Carried headers: everything inbound except the bookkeeping block,
        // and except previous exception info when stripping.
        if let Some(inbound) = record.headers() {
            for i in 0..inbound.count() {
                let header = inbound.get(i);
                if headers::is_retry_bookkeeping(header.key) {
                    continue;
                }
                if self.strip_previous_exception_headers
                    && headers::is_exception_provenance(header.key)
                {
                    continue;
                }
                out.push((
                    header.key.to_string(),
                    header.value.map(|v| v.to_vec()).unwrap_or_default(),
                ));
            }
        }

        // Fresh bookkeeping block.
        out.push((
            headers::ATTEMPTS.to_string(),
            headers::encode_attempts(attempts + 1).to_vec(),
        ));
        out.push((
            headers::ORIGINAL_TIMESTAMP.to_string(),
            headers::encode_timestamp(original_ts),
        ));
        out.push((
            headers::BACKOFF_TIMESTAMP.to_string(),
            headers::encode_timestamp(due_ms),
        ));

        // Original-record provenance, captured once unless appending.
        let mut partition_bytes = [0u8; 4];
        BigEndian::write_i32(&mut partition_bytes, record.partition());
        let mut offset_bytes = [0u8; 8];
        BigEndian::write_i64(&mut offset_bytes, record.offset());
        let mut timestamp_bytes = [0u8; 8];
        BigEndian::write_i64(
            &mut timestamp_bytes,
            record.timestamp().to_millis().unwrap_or(-1),
        );

        let mut originals: Vec<(&str, Vec<u8>)> = vec![
            (headers::SOURCE_TOPIC, record.topic().as_bytes().to_vec()),
            (headers::SOURCE_PARTITION, partition_bytes.to_vec()),
            (headers::SOURCE_OFFSET, offset_bytes.to_vec()),
            (headers::SOURCE_TIMESTAMP, timestamp_bytes.to_vec()),
            (
                headers::SOURCE_TIMESTAMP_TYPE,
                headers::timestamp_type_name(record.timestamp())
                    .as_bytes()
                    .to_vec(),
            ),
        ];
        if let Some(group) = &self.group_id {
            originals.push((headers::SOURCE_CONSUMER_GROUP, group.as_bytes().to_vec()));
        }
        for (name, value) in originals {
            if self.append_original_headers || headers::last_header(record, name).is_none() {
                out.push((name.to_string(), value));
            }
        }

        // Fresh exception info for the fault that routed us here.
        out.push((
            headers::EXCEPTION_FQCN.to_string(),
            fault.wire_name().as_bytes().to_vec(),
        ));
        if let Some(cause) = fault.immediate_cause() {
            out.push((
                headers::EXCEPTION_CAUSE_FQCN.to_string(),
                cause.wire_name().as_bytes().to_vec(),
            ));
        }
        out.push((
            headers::EXCEPTION_MESSAGE.to_string(),
            fault.to_string().into_bytes(),
        ));
        out.push((
            headers::EXCEPTION_STACKTRACE.to_string(),
            fault.render_chain().into_bytes(),
        ));

        let partition = match destination.num_partitions {
            Some(n) if record.partition() >= n => None,
            _ => Some(record.partition()),
        };

        OutboundRecord {
            topic: destination.name.clone(),
            partition,
            key: record.key().map(|k| k.to_vec()),
            payload: record.payload().map(|p| p.to_vec()),
            headers: out,
        }
    }
}

#[async_trait]
impl RecordRecoverer for RecoveryPublisher {
    async fn recover(&self, record: &OwnedMessage, fault: &Fault) -> RetryResult<()> {
        self.forward(record, fault).await.map(|_| ())
    }
}
