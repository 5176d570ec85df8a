//! Retry-aware consumer worker
//!
//! One [`RetryConsumer`] serves the whole retry chain of its source
//! topics: it subscribes to the main and retry hops (plus the dead letter
//! when configured), gates early records through the backoff manager,
//! invokes the application handler and hands every failure to the fault
//! router. The worker is sequential; run several consumers for parallelism.

use crate::backoff::BackoffManager;
use crate::batch::{BatchFailureProcessor, BatchInvoker, FallbackBatchHandler};
use crate::broker::{CommitMode, ConsumerOps, TopicPartition};
use crate::classify::FaultClassifier;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConsumerConfig, RetryTopicConfig};
use crate::destination::{build_chain, DestinationResolver, DestinationTopic, SuffixNamer};
use crate::error::{Fault, FaultKind, RetryError, RetryResult};
use crate::kafka::{create_producer, create_stream_consumer, KafkaPublisher};
use crate::recovery::{RecordRecoverer, RecoveryPublisher};
use crate::router::{DelegatingFaultRouter, Disposition, FaultStrategy, NonBlockingRetry};
use crate::shutdown::ShutdownState;
use crate::tracker::FailureTracker;
use async_trait::async_trait;
use futures::future::FutureExt;
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::{Message, OwnedMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for in-flight work to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Application-side record processing.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    /// Handles one record.
    async fn handle(&self, record: &OwnedMessage) -> Result<(), Fault>;

    /// Handles a delivered batch.
    ///
    /// The default processes records one at a time and tags the first
    /// failure with its position, which lets the batch machinery commit
    /// the clean prefix and continue from the failed record.
    async fn handle_batch(&self, records: &[OwnedMessage]) -> Result<(), Fault> {
        for (index, record) in records.iter().enumerate() {
            if let Err(fault) = self.handle(record).await {
                return Err(Fault::batch_index(index, fault));
            }
        }
        Ok(())
    }
}

/// Topics of a chain this worker consumes from.
fn consumable_topics(chain: &[Arc<DestinationTopic>], process_dlt: bool) -> Vec<String> {
    chain
        .iter()
        .filter(|topic| {
            topic.is_main() || topic.is_retry() || (topic.is_dead_letter() && process_dlt)
        })
        .map(|topic| topic.name.clone())
        .collect()
}

/// Next-to-consume offsets for a processed slice, highest per partition.
fn latest_offsets(records: &[OwnedMessage]) -> Vec<(TopicPartition, i64)> {
    let mut offsets: Vec<(TopicPartition, i64)> = Vec::new();
    for record in records {
        let partition = TopicPartition::from_message(record);
        let next = record.offset() + 1;
        match offsets.iter_mut().find(|(existing, _)| *existing == partition) {
            Some((_, highest)) => *highest = (*highest).max(next),
            None => offsets.push((partition, next)),
        }
    }
    offsets
}

fn rewind_to(record: &OwnedMessage, consumer: &dyn ConsumerOps) {
    let partition = TopicPartition::from_message(record);
    if let Err(error) = consumer.seek(&partition, record.offset()) {
        warn!(
            partition = %partition,
            offset = record.offset(),
            %error,
            "failed to seek back for redelivery"
        );
    }
}

/// A consumer worker with non-blocking retry and dead-letter routing.
pub struct RetryConsumer<H: RecordHandler> {
    consumer_config: ConsumerConfig,
    retry_config: RetryTopicConfig,
    handler: Arc<H>,
    consumer: Arc<StreamConsumer>,
    resolver: Arc<DestinationResolver>,
    router: DelegatingFaultRouter,
    backoff: Arc<BackoffManager>,
    tracker: Arc<FailureTracker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_state: Arc<ShutdownState>,
    wake_interval: Duration,
}

impl<H: RecordHandler> RetryConsumer<H> {
    /// Builds the full retry stack around one stream consumer.
    ///
    /// Registers and seals the destination chains of every source topic,
    /// subscribes to their consumable hops and wires the default
    /// non-blocking retry strategy. Fails on invalid configuration or when
    /// the Kafka clients cannot be created.
    pub async fn new(
        consumer_config: ConsumerConfig,
        retry_config: RetryTopicConfig,
        handler: H,
    ) -> RetryResult<Self> {
        consumer_config.validate().map_err(RetryError::Config)?;
        retry_config.validate().map_err(RetryError::Config)?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let classifier = Arc::new(FaultClassifier::default());
        let resolver = Arc::new(DestinationResolver::new(classifier.clone(), clock.clone()));

        let namer = SuffixNamer::from_config(&retry_config);
        let mut topics = Vec::new();
        for source in &consumer_config.source_topics {
            let chain = build_chain(source, &retry_config, &namer);
            topics.extend(consumable_topics(&chain, retry_config.process_dlt));
            resolver.register_chain(&chain)?;
        }
        resolver.seal();

        let consumer = Arc::new(create_stream_consumer(&consumer_config, &topics).await?);
        let producer = create_producer(&consumer_config)?;
        let publisher = Arc::new(KafkaPublisher::new(producer, consumer_config.network_timeout));

        let recoverer: Arc<dyn RecordRecoverer> = Arc::new(
            RecoveryPublisher::new(resolver.clone(), publisher, clock.clone())
                .with_group_id(consumer_config.group_id.clone())
                .with_append_original_headers(retry_config.append_original_headers)
                .with_strip_previous_exception_headers(
                    retry_config.strip_previous_exception_headers,
                ),
        );

        let shutdown_state = Arc::new(ShutdownState::new());
        let tracker = Arc::new(FailureTracker::new(retry_config.blocking_retry.clone()));
        let fallback = FallbackBatchHandler::new(
            retry_config.blocking_retry.clone(),
            recoverer.clone(),
            shutdown_state.clone(),
        );
        let processor = Arc::new(BatchFailureProcessor::new(
            recoverer.clone(),
            tracker.clone(),
            fallback,
            &retry_config,
        ));
        let default_strategy: Arc<dyn FaultStrategy> = Arc::new(NonBlockingRetry::new(
            recoverer,
            processor,
            classifier,
            &retry_config,
        ));
        let router = DelegatingFaultRouter::new(default_strategy);

        let wake_interval = retry_config
            .wake_interval
            .unwrap_or_else(|| BackoffManager::wake_interval(retry_config.delay.delay_for(0)));
        let backoff = Arc::new(BackoffManager::new(clock));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            group = %consumer_config.group_id,
            topics = topics.len(),
            "retry consumer wired"
        );

        Ok(Self {
            consumer_config,
            retry_config,
            handler: Arc::new(handler),
            consumer,
            resolver,
            router,
            backoff,
            tracker,
            shutdown_tx,
            shutdown_rx,
            shutdown_state,
            wake_interval,
        })
    }

    /// The destination registry serving this consumer.
    pub fn resolver(&self) -> &Arc<DestinationResolver> {
        &self.resolver
    }

    /// The classifier deciding which fault kinds skip the retry hops.
    pub fn classifier(&self) -> &FaultClassifier {
        self.resolver.classifier()
    }

    /// Registers a strategy consulted ahead of the default for one fault
    /// kind. Call before [`run`](Self::run).
    pub fn add_delegate(
        &mut self,
        kind: FaultKind,
        strategy: Arc<dyn FaultStrategy>,
    ) -> RetryResult<()> {
        self.router.add_delegate(kind, strategy)
    }

    /// Drives the poll loop until [`shutdown`](Self::shutdown) is called
    /// or an unrecoverable error stops the worker.
    pub async fn run(&self) -> RetryResult<()> {
        info!(
            group = %self.consumer_config.group_id,
            batching = self.consumer_config.enable_batching,
            "Starting consumer loop"
        );
        let result = if self.consumer_config.enable_batching {
            self.run_batch_loop().await
        } else {
            self.run_record_loop().await
        };
        info!("Consumer loop ended");
        result
    }

    async fn run_record_loop(&self) -> RetryResult<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut wake = tokio::time::interval(self.wake_interval);
        wake.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Worker received shutdown signal");
                    break;
                }
                _ = wake.tick() => {
                    self.backoff.resume_due(self.consumer.as_ref());
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(borrowed) => {
                            let record = borrowed.detach();
                            self.shutdown_state.add_inflight_record().await;
                            let result = self.process_record(&record).await;
                            self.shutdown_state.remove_inflight_record().await;
                            match result {
                                Ok(()) => {}
                                Err(RetryError::Stopped) => {
                                    info!("Record handling interrupted by shutdown");
                                    break;
                                }
                                Err(error) => {
                                    error!("Worker stopping on unrecoverable error: {}", error);
                                    return Err(error);
                                }
                            }
                        }
                        Err(error) => {
                            error!("Kafka error: {}", error);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_record(&self, record: &OwnedMessage) -> RetryResult<()> {
        let consumer = self.consumer.as_ref();

        if self.backoff.intercept(record, consumer).is_err() {
            // Not due yet. The partition is paused; rewind so the record
            // is redelivered once it resumes.
            rewind_to(record, consumer);
            return Ok(());
        }

        let outcome = match tokio::time::timeout(
            self.consumer_config.processing_timeout,
            self.handler.handle(record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Fault::Timeout(format!(
                "record handling exceeded {:?}",
                self.consumer_config.processing_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                self.commit_processed(std::slice::from_ref(record));
                Ok(())
            }
            Err(fault) => {
                let fault = Fault::handler(fault);
                self.dispatch_record_fault(record, &fault).await
            }
        }
    }

    async fn dispatch_record_fault(
        &self,
        record: &OwnedMessage,
        fault: &Fault,
    ) -> RetryResult<()> {
        warn!(
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            %fault,
            "record handling failed"
        );
        let strategy = self.router.route(fault);
        match strategy
            .handle_record(record, fault, self.consumer.as_ref())
            .await
        {
            Ok(Disposition::Recovered) => {
                if strategy.ack_after_handle() {
                    self.commit_processed(std::slice::from_ref(record));
                }
                Ok(())
            }
            Ok(Disposition::Redeliver) => Ok(()),
            // Custom strategies may surface the backoff signal raw; it is
            // not a failure.
            Err(RetryError::BackoffNotElapsed { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn run_batch_loop(&self) -> RetryResult<()> {
        let batch_size = self.consumer_config.batch_size;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut batch: Vec<OwnedMessage> = Vec::with_capacity(batch_size);
        let mut batch_timer = tokio::time::interval(self.consumer_config.batch_timeout);
        batch_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Worker received shutdown signal");
                    break;
                }
                _ = batch_timer.tick() => {
                    if !batch.is_empty() {
                        let ready = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        self.process_batch(ready).await?;
                    }
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(borrowed) => {
                            batch.push(borrowed.detach());
                            if batch.len() >= batch_size {
                                let ready = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                                self.process_batch(ready).await?;
                            }
                        }
                        Err(error) => {
                            error!("Kafka error: {}", error);
                        }
                    }
                }
            }
        }

        if !batch.is_empty() {
            info!("Processing final batch of {} records", batch.len());
            self.process_batch(batch).await?;
        }
        Ok(())
    }

    async fn process_batch(&self, batch: Vec<OwnedMessage>) -> RetryResult<()> {
        debug!("Processing batch of {} records", batch.len());
        self.shutdown_state.add_inflight_record().await;
        let result = self.drive_batch(batch).await;
        self.shutdown_state.remove_inflight_record().await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::SeekRedelivery { remaining }) => {
                debug!(remaining, "batch re-seeked, re-driving the poll loop");
                Ok(())
            }
            Err(RetryError::Stopped) => {
                // The shutdown watch ends the loop; nothing to escalate.
                info!("Batch handling interrupted by shutdown");
                Ok(())
            }
            Err(error) => {
                error!("Worker stopping on unrecoverable error: {}", error);
                Err(error)
            }
        }
    }

    async fn drive_batch(&self, batch: Vec<OwnedMessage>) -> RetryResult<()> {
        let first_fault = match self.handler.handle_batch(&batch).await {
            Ok(()) => {
                self.commit_processed(&batch);
                self.tracker.clear_all();
                return Ok(());
            }
            Err(fault) => fault,
        };

        let handler = self.handler.clone();
        let mut invoke: BatchInvoker = Box::new(move |records: Vec<OwnedMessage>| {
            let handler = handler.clone();
            async move { handler.handle_batch(&records).await }.boxed()
        });

        let mut fault = first_fault;
        let mut pending = batch;
        loop {
            warn!(records = pending.len(), %fault, "batch handling failed");
            let strategy = self.router.route(&fault);
            let remaining = strategy
                .handle_batch(&fault, pending, self.consumer.as_ref(), &mut invoke)
                .await?;
            if remaining.is_empty() {
                return Ok(());
            }
            match self.handler.handle_batch(&remaining).await {
                Ok(()) => {
                    self.commit_processed(&remaining);
                    self.tracker.clear_all();
                    return Ok(());
                }
                Err(next) => {
                    fault = next;
                    pending = remaining;
                }
            }
        }
    }

    fn commit_processed(&self, records: &[OwnedMessage]) {
        let offsets = latest_offsets(records);
        if offsets.is_empty() {
            return;
        }
        let mode = if self.retry_config.sync_commits {
            CommitMode::Sync
        } else {
            CommitMode::Async
        };
        if let Err(error) = self.consumer.as_ref().commit(&offsets, mode) {
            error!("Failed to commit offsets: {}", error);
        }
    }

    /// Signals the worker to stop and waits for in-flight work to finish.
    pub async fn shutdown(&self) -> RetryResult<()> {
        info!("Initiating consumer shutdown");
        self.shutdown_state.begin_shutdown().await;
        self.shutdown_tx
            .send(true)
            .map_err(|_| RetryError::Shutdown("shutdown signal receiver dropped".to_string()))?;

        self.shutdown_state
            .wait_for_completion(SHUTDOWN_TIMEOUT)
            .await
            .map_err(RetryError::Shutdown)?;

        info!("Consumer shutdown complete");
        Ok(())
    }
}
