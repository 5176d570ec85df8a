//! Due-time gating for forwarded records
//!
//! Records arriving on a retry topic carry the timestamp at which they
//! become due. A record seen early pauses its partition and is seeked back;
//! the partition is resumed once the due time passes, so consumption of a
//! delayed topic never blocks the poll loop.

use crate::broker::{ConsumerOps, TopicPartition};
use crate::clock::Clock;
use crate::error::Fault;
use crate::headers;
use dashmap::DashMap;
use rdkafka::message::OwnedMessage;
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MIN_WAKE: Duration = Duration::from_millis(250);
const MAX_WAKE: Duration = Duration::from_secs(5);

/// Pauses partitions whose head record is not yet due and resumes them
/// once the clock catches up.
pub struct BackoffManager {
    clock: Arc<dyn Clock>,
    due: DashMap<TopicPartition, i64>,
}

impl BackoffManager {
    /// Creates a manager reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            due: DashMap::new(),
        }
    }

    /// Gates one consumed record.
    ///
    /// Returns [`Fault::BackoffNotElapsed`] when the record is early; the
    /// partition is paused and the caller is expected to seek back so the
    /// record is redelivered after resume. Records without a due-time
    /// header pass straight through.
    pub fn intercept(
        &self,
        record: &OwnedMessage,
        consumer: &dyn ConsumerOps,
    ) -> Result<(), Fault> {
        let Some(due_ms) = headers::read_backoff_timestamp(record) else {
            return Ok(());
        };
        let partition = TopicPartition::from_message(record);
        let now = self.clock.now_millis();

        if now >= due_ms {
            if self.due.remove(&partition).is_some() {
                if let Err(error) = consumer.resume(slice::from_ref(&partition)) {
                    warn!(partition = %partition, %error, "failed to resume partition");
                }
            }
            return Ok(());
        }

        debug!(partition = %partition, due_ms, now, "record not due yet, pausing partition");
        if let Err(error) = consumer.pause(slice::from_ref(&partition)) {
            warn!(partition = %partition, %error, "failed to pause partition");
        }
        self.due.insert(partition, due_ms);
        Err(Fault::BackoffNotElapsed { due_ms })
    }

    /// Resumes every paused partition whose due time has passed.
    ///
    /// Returns how many partitions were resumed. Meant to be driven from
    /// the consumer's wake ticker.
    pub fn resume_due(&self, consumer: &dyn ConsumerOps) -> usize {
        let now = self.clock.now_millis();
        let ready: Vec<TopicPartition> = self
            .due
            .iter()
            .filter(|entry| now >= *entry.value())
            .map(|entry| entry.key().clone())
            .collect();
        if ready.is_empty() {
            return 0;
        }
        for partition in &ready {
            self.due.remove(partition);
        }
        if let Err(error) = consumer.resume(&ready) {
            warn!(partitions = ready.len(), %error, "failed to resume due partitions");
        }
        debug!(partitions = ready.len(), "resumed partitions with elapsed backoff");
        ready.len()
    }

    /// Number of partitions currently held back.
    pub fn pending(&self) -> usize {
        self.due.len()
    }

    /// How often the wake ticker should fire for a chain whose shortest
    /// hop delay is `shortest_delay`.
    pub fn wake_interval(shortest_delay: Duration) -> Duration {
        (shortest_delay / 4).clamp(MIN_WAKE, MAX_WAKE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{record, record_with_headers, ConsumerCall, MockConsumer, BASE_TIMESTAMP_MS};

    const T0: i64 = BASE_TIMESTAMP_MS;

    fn due_record(topic: &str, partition: i32, offset: i64, due_ms: i64) -> OwnedMessage {
        record_with_headers(
            topic,
            partition,
            offset,
            b"x",
            &[(headers::BACKOFF_TIMESTAMP, headers::encode_timestamp(due_ms))],
        )
    }

    #[test]
    fn record_without_due_time_passes() {
        let clock = ManualClock::at(T0);
        let manager = BackoffManager::new(clock);
        let consumer = MockConsumer::new();

        let result = manager.intercept(&record("orders", 0, 1, b"x"), &consumer);
        assert!(result.is_ok());
        assert!(consumer.calls().is_empty());
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn early_record_pauses_its_partition() {
        let clock = ManualClock::at(T0);
        let manager = BackoffManager::new(clock);
        let consumer = MockConsumer::new();
        let rec = due_record("orders-retry-1000", 2, 5, T0 + 1000);

        let fault = manager.intercept(&rec, &consumer).unwrap_err();
        assert!(matches!(fault, Fault::BackoffNotElapsed { due_ms } if due_ms == T0 + 1000));
        assert_eq!(manager.pending(), 1);

        let expected = TopicPartition::new("orders-retry-1000", 2);
        assert!(consumer
            .calls()
            .iter()
            .any(|call| matches!(call, ConsumerCall::Pause(tps) if tps == &[expected.clone()])));
    }

    #[test]
    fn due_record_passes_and_resumes_pending_partition() {
        let clock = ManualClock::at(T0);
        let manager = BackoffManager::new(clock.clone());
        let consumer = MockConsumer::new();
        let rec = due_record("orders-retry-1000", 0, 5, T0 + 1000);

        assert!(manager.intercept(&rec, &consumer).is_err());
        clock.advance(1000);
        assert!(manager.intercept(&rec, &consumer).is_ok());
        assert_eq!(manager.pending(), 0);

        let expected = TopicPartition::new("orders-retry-1000", 0);
        assert!(consumer
            .calls()
            .iter()
            .any(|call| matches!(call, ConsumerCall::Resume(tps) if tps == &[expected.clone()])));
    }

    #[test]
    fn resume_due_restores_only_elapsed_partitions() {
        let clock = ManualClock::at(T0);
        let manager = BackoffManager::new(clock.clone());
        let consumer = MockConsumer::new();

        assert!(manager
            .intercept(&due_record("orders-retry-1000", 0, 1, T0 + 1000), &consumer)
            .is_err());
        assert!(manager
            .intercept(&due_record("orders-retry-5000", 0, 1, T0 + 5000), &consumer)
            .is_err());

        clock.advance(2000);
        assert_eq!(manager.resume_due(&consumer), 1);
        assert_eq!(manager.pending(), 1);

        let resumed: Vec<_> = consumer
            .calls()
            .iter()
            .filter_map(|call| match call {
                ConsumerCall::Resume(tps) => Some(tps.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(resumed, vec![vec![TopicPartition::new("orders-retry-1000", 0)]]);
    }

    #[test]
    fn resume_due_with_nothing_pending_is_quiet() {
        let clock = ManualClock::at(T0);
        let manager = BackoffManager::new(clock);
        let consumer = MockConsumer::new();

        assert_eq!(manager.resume_due(&consumer), 0);
        assert!(consumer.calls().is_empty());
    }

    #[test]
    fn wake_interval_is_clamped() {
        assert_eq!(
            BackoffManager::wake_interval(Duration::from_millis(400)),
            Duration::from_millis(250)
        );
        assert_eq!(
            BackoffManager::wake_interval(Duration::from_secs(4)),
            Duration::from_secs(1)
        );
        assert_eq!(
            BackoffManager::wake_interval(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
    }
}
