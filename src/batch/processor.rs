//! Partial offset commits and selective redelivery after a batch failure

use super::fallback::FallbackBatchHandler;
use super::BatchInvoker;
use crate::broker::{CommitMode, ConsumerOps, TopicPartition};
use crate::config::RetryTopicConfig;
use crate::error::{BatchItemRef, Fault, RetryError, RetryResult};
use crate::recovery::RecordRecoverer;
use crate::tracker::FailureTracker;
use rdkafka::message::{Message, OwnedMessage};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Orchestrates what happens to a batch after one record in it failed.
///
/// Records before the failed one are committed. The failed record and the
/// ones after it are either returned for continued in-process handling
/// (skip-first mode) or re-seeked for full redelivery (seek-after-error
/// mode). Faults that do not identify a record degrade to the fallback
/// whole-batch handler.
pub struct BatchFailureProcessor {
    recoverer: Arc<dyn RecordRecoverer>,
    tracker: Arc<FailureTracker>,
    fallback: FallbackBatchHandler,
    commit_mode: CommitMode,
    seek_after_error: bool,
}

impl BatchFailureProcessor {
    /// Creates a processor following `config`'s commit and seek settings.
    pub fn new(
        recoverer: Arc<dyn RecordRecoverer>,
        tracker: Arc<FailureTracker>,
        fallback: FallbackBatchHandler,
        config: &RetryTopicConfig,
    ) -> Self {
        Self {
            recoverer,
            tracker,
            fallback,
            commit_mode: if config.sync_commits {
                CommitMode::Sync
            } else {
                CommitMode::Async
            },
            seek_after_error: config.seek_after_error,
        }
    }

    /// Handles a failed batch invocation and returns the records still
    /// owed to the handler.
    ///
    /// `SeekRedelivery` errors are not failures: they tell the worker the
    /// records were re-seeked and the poll loop must be re-driven.
    pub async fn handle(
        &self,
        fault: &Fault,
        batch: Vec<OwnedMessage>,
        consumer: &dyn ConsumerOps,
        invoke: &mut BatchInvoker,
    ) -> RetryResult<Vec<OwnedMessage>> {
        let Some(index) = locate(fault, &batch) else {
            warn!(
                %fault,
                records = batch.len(),
                "fault does not identify a batch record, redelivering the whole batch"
            );
            self.fallback.handle(fault, &batch, consumer, invoke).await?;
            return Ok(Vec::new());
        };

        let record_fault = fault
            .batch_item()
            .map(|(_, source)| source)
            .unwrap_or(fault);

        self.commit_completed(&batch[..index], consumer)?;

        let mut remaining = batch;
        remaining.drain(..index);

        if self.seek_after_error {
            self.seek_or_recover(record_fault, remaining, consumer).await
        } else {
            self.recover_first(record_fault, remaining).await
        }
    }

    /// Commits the offsets of the records that were processed before the
    /// failure. A failed asynchronous commit is logged, never fatal.
    fn commit_completed(
        &self,
        completed: &[OwnedMessage],
        consumer: &dyn ConsumerOps,
    ) -> RetryResult<()> {
        if completed.is_empty() {
            return Ok(());
        }
        let mut offsets: Vec<(TopicPartition, i64)> = Vec::new();
        for record in completed {
            let partition = TopicPartition::from_message(record);
            let next = record.offset() + 1;
            match offsets.iter_mut().find(|(existing, _)| *existing == partition) {
                Some((_, offset)) => *offset = (*offset).max(next),
                None => offsets.push((partition, next)),
            }
        }
        debug!(records = completed.len(), commits = offsets.len(), "committing completed records");
        match self.commit_mode {
            CommitMode::Sync => consumer.commit(&offsets, CommitMode::Sync),
            CommitMode::Async => {
                if let Err(commit_error) = consumer.commit(&offsets, CommitMode::Async) {
                    warn!(%commit_error, "async commit of completed records failed");
                }
                Ok(())
            }
        }
    }

    /// Skip-first mode: the failed record goes straight to the recoverer
    /// and the rest of the batch is returned for in-process handling.
    async fn recover_first(
        &self,
        fault: &Fault,
        mut remaining: Vec<OwnedMessage>,
    ) -> RetryResult<Vec<OwnedMessage>> {
        let Some(first) = remaining.first() else {
            return Ok(remaining);
        };
        match self.recoverer.recover(first, fault).await {
            Ok(()) => {
                self.tracker.clear(first);
                remaining.remove(0);
                Ok(remaining)
            }
            Err(RetryError::BackoffNotElapsed { due_ms }) => {
                // Dropping the record here would silently skip it; keep it
                // so it is redelivered once due.
                debug!(
                    topic = first.topic(),
                    offset = first.offset(),
                    due_ms,
                    "record not due, keeping it in the batch"
                );
                Ok(remaining)
            }
            Err(recovery_error) => {
                error!(
                    topic = first.topic(),
                    partition = first.partition(),
                    offset = first.offset(),
                    %recovery_error,
                    "recovery failed, keeping record for redelivery"
                );
                Ok(remaining)
            }
        }
    }

    /// Seek-after-error mode: redeliver the remaining records through the
    /// broker while the failed record's in-place budget lasts, then
    /// recover it and redeliver only the rest.
    async fn seek_or_recover(
        &self,
        fault: &Fault,
        remaining: Vec<OwnedMessage>,
        consumer: &dyn ConsumerOps,
    ) -> RetryResult<Vec<OwnedMessage>> {
        let Some(first) = remaining.first() else {
            return Ok(remaining);
        };

        if fault.is_backoff() {
            seek_to_earliest(&remaining, consumer);
            return Err(RetryError::SeekRedelivery {
                remaining: remaining.len(),
            });
        }

        self.tracker.record_failure(first);
        if self.tracker.should_retry(first) {
            seek_to_earliest(&remaining, consumer);
            return Err(RetryError::SeekRedelivery {
                remaining: remaining.len(),
            });
        }

        match self.recoverer.recover(first, fault).await {
            Ok(()) => {
                self.tracker.clear(first);
                seek_to_earliest(&remaining[1..], consumer);
                self.commit_recovered(first, consumer);
                let rest = remaining.len() - 1;
                if rest > 0 {
                    Err(RetryError::SeekRedelivery { remaining: rest })
                } else {
                    Ok(Vec::new())
                }
            }
            Err(recovery_error) => {
                error!(
                    topic = first.topic(),
                    partition = first.partition(),
                    offset = first.offset(),
                    %recovery_error,
                    "recovery failed, redelivering the whole remainder"
                );
                seek_to_earliest(&remaining, consumer);
                Err(RetryError::SeekRedelivery {
                    remaining: remaining.len(),
                })
            }
        }
    }

    /// Advances the committed offset past a recovered record so the
    /// recovery is not repeated after a rebalance.
    fn commit_recovered(&self, record: &OwnedMessage, consumer: &dyn ConsumerOps) {
        let offsets = [(TopicPartition::from_message(record), record.offset() + 1)];
        if let Err(commit_error) = consumer.commit(&offsets, self.commit_mode) {
            warn!(
                %commit_error,
                topic = record.topic(),
                offset = record.offset(),
                "commit of recovered record failed"
            );
        }
    }
}

/// Position of the failed record inside `batch`, if the fault names one.
fn locate(fault: &Fault, batch: &[OwnedMessage]) -> Option<usize> {
    let (at, _) = fault.batch_item()?;
    match at {
        BatchItemRef::Index(index) => (*index < batch.len()).then_some(*index),
        BatchItemRef::Record {
            topic,
            partition,
            offset,
        } => batch.iter().position(|record| {
            record.topic() == topic
                && record.partition() == *partition
                && record.offset() == *offset
        }),
    }
}

/// Seeks each partition back to its earliest offset among `records`.
pub(super) fn seek_to_earliest(records: &[OwnedMessage], consumer: &dyn ConsumerOps) {
    let mut earliest: Vec<(TopicPartition, i64)> = Vec::new();
    for record in records {
        let partition = TopicPartition::from_message(record);
        match earliest.iter_mut().find(|(existing, _)| *existing == partition) {
            Some((_, offset)) => *offset = (*offset).min(record.offset()),
            None => earliest.push((partition, record.offset())),
        }
    }
    for (partition, offset) in &earliest {
        if let Err(seek_error) = consumer.seek(partition, *offset) {
            warn!(partition = %partition, offset, %seek_error, "seek for redelivery failed");
        }
    }
}
