//! Graceful shutdown management for consumer workers

use crate::error::{RetryError, RetryResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Manages the graceful shutdown state of a consumer worker
#[derive(Debug)]
pub struct ShutdownState {
    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
    /// Whether shutdown is complete
    shutdown_complete: AtomicBool,
    /// Number of in-flight records
    inflight_records: AtomicUsize,
    /// Shutdown initiated timestamp
    shutdown_start: tokio::sync::RwLock<Option<Instant>>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            shutdown_complete: AtomicBool::new(false),
            inflight_records: AtomicUsize::new(0),
            shutdown_start: tokio::sync::RwLock::new(None),
        }
    }

    /// Begin the shutdown process
    pub async fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let mut shutdown_start = self.shutdown_start.write().await;
        *shutdown_start = Some(Instant::now());
        info!("Shutdown initiated");
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Complete the shutdown process
    pub async fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Relaxed);
        if let Some(start) = *self.shutdown_start.read().await {
            let duration = start.elapsed();
            info!("Shutdown completed in {:?}", duration);
        }
    }

    /// Check if shutdown is complete
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Relaxed)
    }

    /// Add an in-flight record
    pub async fn add_inflight_record(&self) {
        let count = self.inflight_records.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("In-flight records: {}", count);
    }

    /// Remove an in-flight record
    pub async fn remove_inflight_record(&self) {
        let count = self.inflight_records.fetch_sub(1, Ordering::Relaxed);
        if count > 0 {
            debug!("In-flight records: {}", count - 1);
        }
    }

    /// Check if there are any in-flight records
    pub async fn has_inflight_records(&self) -> bool {
        self.inflight_records.load(Ordering::Relaxed) > 0
    }

    /// Get the count of in-flight records
    pub async fn inflight_count(&self) -> usize {
        self.inflight_records.load(Ordering::Relaxed)
    }

    /// Get the duration since shutdown started
    pub async fn shutdown_duration(&self) -> Option<Duration> {
        if let Some(start) = *self.shutdown_start.read().await {
            Some(start.elapsed())
        } else {
            None
        }
    }

    /// Wait for all in-flight records to complete with timeout
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;

        while self.has_inflight_records().await {
            if Instant::now() > deadline {
                let count = self.inflight_count().await;
                return Err(format!(
                    "Shutdown timeout with {} records still in flight",
                    count
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.complete_shutdown().await;
        Ok(())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps for `duration` in short slices, aborting with [`RetryError::Stopped`]
/// as soon as shutdown begins.
///
/// Retry loops sleep through this so a worker stop never has to wait out a
/// full backoff interval.
pub async fn stoppable_sleep(state: &ShutdownState, duration: Duration) -> RetryResult<()> {
    const SLICE: Duration = Duration::from_millis(100);

    let deadline = Instant::now() + duration;
    loop {
        if state.is_shutting_down() {
            return Err(RetryError::Stopped);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        tokio::time::sleep(remaining.min(SLICE)).await;
    }
}
