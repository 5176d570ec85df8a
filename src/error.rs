//! Fault taxonomy and machinery errors
//!
//! Two error families live here. [`Fault`] is what record processing raises:
//! it is the value that gets classified, routed, and written into dead-letter
//! headers. [`RetryError`] is what the retry machinery itself raises when a
//! chain is misconfigured, a publish cannot be confirmed, or a worker has to
//! signal its caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for machinery operations.
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// The kind of a processing fault, used for classification and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Record payload could not be decoded.
    Deserialization,
    /// Decoded payload could not be converted to the handler's input.
    Conversion,
    /// A typed argument could not be extracted for the handler.
    PayloadExtraction,
    /// No handler is registered for the record.
    MissingHandler,
    /// A payload downcast failed.
    Downcast,
    /// An I/O error while handling the record.
    Io,
    /// Handling timed out.
    Timeout,
    /// Generic processing failure.
    Processing,
    /// The partition's backoff window has not elapsed.
    Backoff,
    /// Listener-invocation wrapper.
    Handler,
    /// Failure-timestamp carrier wrapper.
    Timestamped,
    /// Failed-record-in-batch wrapper.
    Batch,
}

impl FaultKind {
    /// Kinds that are never worth retrying: redelivering the same bytes to
    /// the same handler cannot change the outcome.
    pub const DEFAULT_FATAL: [FaultKind; 5] = [
        FaultKind::Deserialization,
        FaultKind::Conversion,
        FaultKind::PayloadExtraction,
        FaultKind::MissingHandler,
        FaultKind::Downcast,
    ];

    /// Stable identifier written into the exception provenance headers.
    pub fn wire_name(&self) -> &'static str {
        match self {
            FaultKind::Deserialization => "DeserializationFault",
            FaultKind::Conversion => "ConversionFault",
            FaultKind::PayloadExtraction => "PayloadExtractionFault",
            FaultKind::MissingHandler => "MissingHandlerFault",
            FaultKind::Downcast => "DowncastFault",
            FaultKind::Io => "IoFault",
            FaultKind::Timeout => "TimeoutFault",
            FaultKind::Processing => "ProcessingFault",
            FaultKind::Backoff => "BackoffSignal",
            FaultKind::Handler => "HandlerFault",
            FaultKind::Timestamped => "TimestampedFault",
            FaultKind::Batch => "BatchItemFault",
        }
    }
}

/// Locates the failed record inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchItemRef {
    /// Zero-based position in the delivered batch.
    Index(usize),
    /// Identity of the failed record.
    Record {
        /// Topic the record was consumed from
        topic: String,
        /// Partition the record was consumed from
        partition: i32,
        /// Offset of the record
        offset: i64,
    },
}

/// A processing failure raised while handling a record or a batch.
///
/// Leaf variants carry the failure itself; `Handler`, `Timestamped` and
/// `BatchItem` wrap an inner fault the way listener adapters layer context
/// onto the original error. `BackoffNotElapsed` is a control signal, not a
/// failure: it means the record was delivered before its due time.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// Record payload could not be decoded
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Decoded payload could not be converted
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Typed argument extraction failed
    #[error("payload extraction failed: {0}")]
    PayloadExtraction(String),

    /// No handler registered for this record
    #[error("no handler registered: {0}")]
    MissingHandler(String),

    /// Payload downcast failed
    #[error("downcast failed: {0}")]
    Downcast(String),

    /// I/O failure during handling
    #[error("i/o error: {0}")]
    Io(String),

    /// Handling timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// Generic processing failure
    #[error("{0}")]
    Processing(String),

    /// The record arrived before its backoff due time
    #[error("backoff not elapsed, due at {due_ms}")]
    BackoffNotElapsed {
        /// Epoch millis at which the record becomes deliverable
        due_ms: i64,
    },

    /// Listener-invocation wrapper around the real fault
    #[error("handler invocation failed")]
    Handler {
        /// The fault raised inside the handler
        #[source]
        source: Box<Fault>,
    },

    /// Carries the timestamp at which the wrapped fault occurred
    #[error("failed at {at_ms}")]
    Timestamped {
        /// Epoch millis of the failure
        at_ms: i64,
        /// The wrapped fault
        #[source]
        source: Box<Fault>,
    },

    /// Marks which record of a delivered batch failed
    #[error("batch item {at:?} failed")]
    BatchItem {
        /// Failed record locator
        at: BatchItemRef,
        /// The fault raised for that record
        #[source]
        source: Box<Fault>,
    },
}

impl Fault {
    /// Wrap a fault the way the listener adapter does.
    pub fn handler(source: Fault) -> Self {
        Fault::Handler {
            source: Box::new(source),
        }
    }

    /// Attach the failure timestamp to a fault.
    pub fn timestamped(at_ms: i64, source: Fault) -> Self {
        Fault::Timestamped {
            at_ms,
            source: Box::new(source),
        }
    }

    /// Mark the failed batch position by index.
    pub fn batch_index(index: usize, source: Fault) -> Self {
        Fault::BatchItem {
            at: BatchItemRef::Index(index),
            source: Box::new(source),
        }
    }

    /// Mark the failed batch record by identity.
    pub fn batch_record(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        source: Fault,
    ) -> Self {
        Fault::BatchItem {
            at: BatchItemRef::Record {
                topic: topic.into(),
                partition,
                offset,
            },
            source: Box::new(source),
        }
    }

    /// Generic processing fault.
    pub fn processing(msg: impl Into<String>) -> Self {
        Fault::Processing(msg.into())
    }

    /// The kind of this fault without unwrapping.
    pub fn shallow_kind(&self) -> FaultKind {
        match self {
            Fault::Deserialization(_) => FaultKind::Deserialization,
            Fault::Conversion(_) => FaultKind::Conversion,
            Fault::PayloadExtraction(_) => FaultKind::PayloadExtraction,
            Fault::MissingHandler(_) => FaultKind::MissingHandler,
            Fault::Downcast(_) => FaultKind::Downcast,
            Fault::Io(_) => FaultKind::Io,
            Fault::Timeout(_) => FaultKind::Timeout,
            Fault::Processing(_) => FaultKind::Processing,
            Fault::BackoffNotElapsed { .. } => FaultKind::Backoff,
            Fault::Handler { .. } => FaultKind::Handler,
            Fault::Timestamped { .. } => FaultKind::Timestamped,
            Fault::BatchItem { .. } => FaultKind::Batch,
        }
    }

    /// The kind of the underlying fault, wrappers unwrapped all the way down.
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Handler { source }
            | Fault::Timestamped { source, .. }
            | Fault::BatchItem { source, .. } => source.kind(),
            other => other.shallow_kind(),
        }
    }

    /// The kind used for strategy routing: exactly one listener-wrapper
    /// level is looked through, nothing else.
    pub fn routing_kind(&self) -> FaultKind {
        match self {
            Fault::Handler { source } => source.shallow_kind(),
            other => other.shallow_kind(),
        }
    }

    /// The immediate wrapped fault, if any.
    pub fn immediate_cause(&self) -> Option<&Fault> {
        match self {
            Fault::Handler { source }
            | Fault::Timestamped { source, .. }
            | Fault::BatchItem { source, .. } => Some(source),
            _ => None,
        }
    }

    /// First failure timestamp found in the chain, outermost first.
    pub fn failure_timestamp(&self) -> Option<i64> {
        match self {
            Fault::Timestamped { at_ms, .. } => Some(*at_ms),
            other => other.immediate_cause().and_then(Fault::failure_timestamp),
        }
    }

    /// Due time of a backoff signal anywhere in the chain.
    pub fn backoff_due(&self) -> Option<i64> {
        match self {
            Fault::BackoffNotElapsed { due_ms } => Some(*due_ms),
            other => other.immediate_cause().and_then(Fault::backoff_due),
        }
    }

    /// Whether a backoff signal is anywhere in the chain.
    pub fn is_backoff(&self) -> bool {
        self.backoff_due().is_some()
    }

    /// Locator and fault of the failed batch record, if the chain carries one.
    pub fn batch_item(&self) -> Option<(&BatchItemRef, &Fault)> {
        match self {
            Fault::BatchItem { at, source } => Some((at, source)),
            other => other.immediate_cause().and_then(Fault::batch_item),
        }
    }

    /// Wire identifier of the top-level fault.
    pub fn wire_name(&self) -> &'static str {
        self.shallow_kind().wire_name()
    }

    /// Renders the fault chain the way it is written into the stack-trace
    /// provenance header.
    pub fn render_chain(&self) -> String {
        let mut out = format!("{}: {}", self.wire_name(), self);
        let mut cause = self.immediate_cause();
        while let Some(fault) = cause {
            out.push_str(&format!("\nCaused by: {}: {}", fault.wire_name(), fault));
            cause = fault.immediate_cause();
        }
        out
    }
}

/// Errors raised by the retry machinery itself.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The topic has no registered destination chain
    #[error("no destination chain registered for topic '{0}'")]
    UnknownTopic(String),

    /// A chain registration arrived after the registry was sealed
    #[error("destination registry is sealed; chains can no longer be registered")]
    RegistrySealed,

    /// Pass-through of the backoff control signal
    #[error("backoff not elapsed, due at {due_ms}")]
    BackoffNotElapsed {
        /// Epoch millis at which the record becomes deliverable
        due_ms: i64,
    },

    /// The destination broker did not confirm the publish
    #[error("publish to '{topic}' was not confirmed: {reason}")]
    PublishNotConfirmed {
        /// Destination topic of the failed publish
        topic: String,
        /// Broker-reported reason
        reason: String,
    },

    /// A delegate strategy disagrees with the default on a container property
    #[error("delegate strategy disagrees on '{property}'")]
    DelegateMismatch {
        /// Name of the mismatched property
        property: &'static str,
    },

    /// The worker stopped while a handler was retrying
    #[error("stopped during retries")]
    Stopped,

    /// Remaining records were re-seeked; the caller must poll again
    #[error("{remaining} record(s) seeked for redelivery")]
    SeekRedelivery {
        /// How many records will be redelivered
        remaining: usize,
    },

    /// Kafka client failure
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Graceful shutdown did not finish cleanly
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl RetryError {
    /// Whether this error is a redelivery signal rather than a failure: the
    /// caller should re-poll, not escalate.
    pub fn is_redelivery_signal(&self) -> bool {
        matches!(
            self,
            RetryError::BackoffNotElapsed { .. } | RetryError::SeekRedelivery { .. }
        )
    }
}
