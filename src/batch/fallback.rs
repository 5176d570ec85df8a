//! Whole-batch redelivery for faults that cannot be localized

use super::BatchInvoker;
use crate::broker::ConsumerOps;
use crate::error::{Fault, RetryResult};
use crate::policy::RetryPolicy;
use crate::recovery::RecordRecoverer;
use crate::shutdown::{stoppable_sleep, ShutdownState};
use rdkafka::message::{Message, OwnedMessage};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Retries an entire batch in place, then recovers every record.
///
/// The assignment is paused for the duration so the poll loop stays quiet
/// while the batch is re-invoked; a keepalive poll runs each round to keep
/// the consumer's group membership alive during long backoffs.
pub struct FallbackBatchHandler {
    policy: RetryPolicy,
    recoverer: Arc<dyn RecordRecoverer>,
    shutdown: Arc<ShutdownState>,
}

impl FallbackBatchHandler {
    /// Creates a handler retrying per `policy` before recovering.
    pub fn new(
        policy: RetryPolicy,
        recoverer: Arc<dyn RecordRecoverer>,
        shutdown: Arc<ShutdownState>,
    ) -> Self {
        Self {
            policy,
            recoverer,
            shutdown,
        }
    }

    /// Redelivers `batch` in place until it succeeds or the budget runs
    /// out, then hands every record to the recoverer.
    ///
    /// On a recovery failure the consumer is seeked back to the start of
    /// the batch and the error propagates, so no record is lost. Aborts
    /// with `Stopped` when shutdown begins mid-loop.
    pub async fn handle(
        &self,
        fault: &Fault,
        batch: &[OwnedMessage],
        consumer: &dyn ConsumerOps,
        invoke: &mut BatchInvoker,
    ) -> RetryResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let assignment = consumer.assignment()?;
        consumer.pause(&assignment)?;
        let result = self.retry_batch(fault, batch, consumer, invoke).await;

        // The assignment may have changed under a rebalance; resume what
        // is assigned now.
        match consumer.assignment() {
            Ok(current) => {
                if let Err(resume_error) = consumer.resume(&current) {
                    warn!(%resume_error, "failed to resume assignment after batch retries");
                }
            }
            Err(assignment_error) => {
                warn!(%assignment_error, "failed to query assignment after batch retries");
            }
        }
        result
    }

    async fn retry_batch(
        &self,
        fault: &Fault,
        batch: &[OwnedMessage],
        consumer: &dyn ConsumerOps,
        invoke: &mut BatchInvoker,
    ) -> RetryResult<()> {
        let mut attempt = 0u32;
        while self.policy.should_retry(attempt) {
            consumer.poll_idle();
            stoppable_sleep(&self.shutdown, self.policy.next_backoff(attempt + 1)).await?;
            match invoke(batch.to_vec()).await {
                Ok(()) => {
                    debug!(attempt, records = batch.len(), "batch redelivery succeeded");
                    return Ok(());
                }
                Err(redelivery_fault) => {
                    debug!(attempt, %redelivery_fault, "batch redelivery failed");
                }
            }
            attempt += 1;
        }

        debug!(
            records = batch.len(),
            "batch retries exhausted, recovering every record"
        );
        for record in batch {
            if let Err(recovery_error) = self.recoverer.recover(record, fault).await {
                error!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    %recovery_error,
                    "batch recovery failed, seeking batch back for redelivery"
                );
                super::processor::seek_to_earliest(batch, consumer);
                return Err(recovery_error);
            }
        }
        Ok(())
    }
}
