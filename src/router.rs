//! Fault routing: pick a handling strategy per fault kind
//!
//! The router unwraps one level of handler wrapper, then matches the fault
//! kind against registered delegates in insertion order, falling back to
//! the default strategy. Strategies carry two cross-cutting properties the
//! worker relies on; delegates whose properties differ from the default's
//! are rejected at registration time.

use crate::batch::{BatchFailureProcessor, BatchInvoker, FallbackBatchHandler};
use crate::broker::{ConsumerOps, TopicPartition};
use crate::classify::FaultClassifier;
use crate::config::{PublishFailurePolicy, RetryTopicConfig};
use crate::error::{Fault, FaultKind, RetryError, RetryResult};
use crate::recovery::RecordRecoverer;
use crate::shutdown::{stoppable_sleep, ShutdownState};
use crate::tracker::FailureTracker;
use async_trait::async_trait;
use rdkafka::message::{Message, OwnedMessage};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What the worker does with a record after its fault was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The record was consumed (forwarded or dropped); commit its offset
    Recovered,
    /// The record will be delivered again; leave the offset alone
    Redeliver,
}

/// One way of handling a fault.
#[async_trait]
pub trait FaultStrategy: Send + Sync {
    /// Whether the worker commits a record handled as `Recovered`.
    fn ack_after_handle(&self) -> bool {
        true
    }

    /// Whether batch handling returns remaining records for in-process
    /// continuation instead of re-seeking them through the broker.
    fn retains_remaining(&self) -> bool {
        false
    }

    /// Handles a failed record.
    async fn handle_record(
        &self,
        record: &OwnedMessage,
        fault: &Fault,
        consumer: &dyn ConsumerOps,
    ) -> RetryResult<Disposition>;

    /// Handles a failed batch, returning the records still owed to the
    /// handler.
    async fn handle_batch(
        &self,
        fault: &Fault,
        batch: Vec<OwnedMessage>,
        consumer: &dyn ConsumerOps,
        invoke: &mut BatchInvoker,
    ) -> RetryResult<Vec<OwnedMessage>>;
}

/// Routes faults to strategies, first registered match wins.
pub struct DelegatingFaultRouter {
    default: Arc<dyn FaultStrategy>,
    delegates: Vec<(FaultKind, Arc<dyn FaultStrategy>)>,
}

impl DelegatingFaultRouter {
    /// Creates a router with only a default strategy.
    pub fn new(default: Arc<dyn FaultStrategy>) -> Self {
        Self {
            default,
            delegates: Vec::new(),
        }
    }

    /// Registers a strategy for one fault kind.
    ///
    /// The delegate must agree with the default on both cross-cutting
    /// properties; the worker cannot serve divergent semantics at once.
    pub fn add_delegate(
        &mut self,
        kind: FaultKind,
        strategy: Arc<dyn FaultStrategy>,
    ) -> RetryResult<()> {
        if strategy.ack_after_handle() != self.default.ack_after_handle() {
            return Err(RetryError::DelegateMismatch {
                property: "ack_after_handle",
            });
        }
        if strategy.retains_remaining() != self.default.retains_remaining() {
            return Err(RetryError::DelegateMismatch {
                property: "retains_remaining",
            });
        }
        self.delegates.push((kind, strategy));
        Ok(())
    }

    /// The strategy handling `fault`.
    pub fn route(&self, fault: &Fault) -> &Arc<dyn FaultStrategy> {
        let kind = fault.routing_kind();
        self.delegates
            .iter()
            .find(|(registered, _)| *registered == kind)
            .map(|(_, strategy)| strategy)
            .unwrap_or(&self.default)
    }
}

/// Forwards failed records through the retry chain.
///
/// This is the strategy the retry-topic machinery exists for; everything
/// it cannot resolve locally escalates through the configured
/// publish-failure policy.
pub struct NonBlockingRetry {
    recoverer: Arc<dyn RecordRecoverer>,
    processor: Arc<BatchFailureProcessor>,
    classifier: Arc<FaultClassifier>,
    publish_failure_policy: PublishFailurePolicy,
    retains_remaining: bool,
}

impl NonBlockingRetry {
    /// Creates the strategy following `config`.
    pub fn new(
        recoverer: Arc<dyn RecordRecoverer>,
        processor: Arc<BatchFailureProcessor>,
        classifier: Arc<FaultClassifier>,
        config: &RetryTopicConfig,
    ) -> Self {
        Self {
            recoverer,
            processor,
            classifier,
            publish_failure_policy: config.publish_failure_policy,
            retains_remaining: !config.seek_after_error,
        }
    }
}

#[async_trait]
impl FaultStrategy for NonBlockingRetry {
    fn retains_remaining(&self) -> bool {
        self.retains_remaining
    }

    async fn handle_record(
        &self,
        record: &OwnedMessage,
        fault: &Fault,
        consumer: &dyn ConsumerOps,
    ) -> RetryResult<Disposition> {
        match self.recoverer.recover(record, fault).await {
            Ok(()) => Ok(Disposition::Recovered),
            Err(RetryError::BackoffNotElapsed { due_ms }) => {
                debug!(
                    topic = record.topic(),
                    offset = record.offset(),
                    due_ms,
                    "record not due, redelivering"
                );
                seek_back(record, consumer);
                Ok(Disposition::Redeliver)
            }
            Err(RetryError::PublishNotConfirmed { topic, reason }) => {
                match self.publish_failure_policy {
                    PublishFailurePolicy::Fail => {
                        Err(RetryError::PublishNotConfirmed { topic, reason })
                    }
                    PublishFailurePolicy::Redeliver => {
                        if self.classifier.is_fatal(fault) {
                            // A fatal fault re-routes to the same dead letter
                            // on every delivery; redelivering would spin on a
                            // broken publish forever.
                            error!(
                                topic = record.topic(),
                                partition = record.partition(),
                                offset = record.offset(),
                                destination = %topic,
                                %reason,
                                "dropping record after failed dead-letter publish"
                            );
                            Ok(Disposition::Recovered)
                        } else {
                            warn!(
                                topic = record.topic(),
                                offset = record.offset(),
                                destination = %topic,
                                %reason,
                                "publish failed, redelivering record"
                            );
                            seek_back(record, consumer);
                            Ok(Disposition::Redeliver)
                        }
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn handle_batch(
        &self,
        fault: &Fault,
        batch: Vec<OwnedMessage>,
        consumer: &dyn ConsumerOps,
        invoke: &mut BatchInvoker,
    ) -> RetryResult<Vec<OwnedMessage>> {
        self.processor.handle(fault, batch, consumer, invoke).await
    }
}

/// Retries the record in place with bounded, jittered sleeps before letting
/// it hop topics.
pub struct BlockingRetry {
    tracker: Arc<FailureTracker>,
    recoverer: Arc<dyn RecordRecoverer>,
    fallback: FallbackBatchHandler,
    shutdown: Arc<ShutdownState>,
    retains_remaining: bool,
}

impl BlockingRetry {
    /// Creates the strategy; the in-place budget comes from the tracker's
    /// policy.
    pub fn new(
        tracker: Arc<FailureTracker>,
        recoverer: Arc<dyn RecordRecoverer>,
        fallback: FallbackBatchHandler,
        shutdown: Arc<ShutdownState>,
        config: &RetryTopicConfig,
    ) -> Self {
        Self {
            tracker,
            recoverer,
            fallback,
            shutdown,
            retains_remaining: !config.seek_after_error,
        }
    }
}

#[async_trait]
impl FaultStrategy for BlockingRetry {
    fn retains_remaining(&self) -> bool {
        self.retains_remaining
    }

    async fn handle_record(
        &self,
        record: &OwnedMessage,
        fault: &Fault,
        consumer: &dyn ConsumerOps,
    ) -> RetryResult<Disposition> {
        self.tracker.record_failure(record);
        if self.tracker.should_retry(record) {
            let backoff = self.tracker.next_backoff(record);
            debug!(
                topic = record.topic(),
                offset = record.offset(),
                failures = self.tracker.failures(record),
                backoff_ms = backoff.as_millis() as u64,
                "retrying record in place"
            );
            seek_back(record, consumer);
            stoppable_sleep(&self.shutdown, backoff).await?;
            return Ok(Disposition::Redeliver);
        }

        // Local budget exhausted; escalate to the retry chain.
        self.recoverer.recover(record, fault).await?;
        self.tracker.clear(record);
        Ok(Disposition::Recovered)
    }

    async fn handle_batch(
        &self,
        fault: &Fault,
        batch: Vec<OwnedMessage>,
        consumer: &dyn ConsumerOps,
        invoke: &mut BatchInvoker,
    ) -> RetryResult<Vec<OwnedMessage>> {
        self.fallback.handle(fault, &batch, consumer, invoke).await?;
        Ok(Vec::new())
    }
}

fn seek_back(record: &OwnedMessage, consumer: &dyn ConsumerOps) {
    let partition = TopicPartition::from_message(record);
    if let Err(seek_error) = consumer.seek(&partition, record.offset()) {
        warn!(
            partition = %partition,
            offset = record.offset(),
            %seek_error,
            "seek for redelivery failed"
        );
    }
}
