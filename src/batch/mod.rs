//! Partial-failure handling for batch consumption
//!
//! When one record in a batch fails, [`BatchFailureProcessor`] commits the
//! offsets of the records that already succeeded and decides what happens
//! to the rest. Faults that cannot be pinned to a record fall back to
//! [`FallbackBatchHandler`], which retries the whole batch in place.

mod fallback;
mod processor;

pub use fallback::FallbackBatchHandler;
pub use processor::BatchFailureProcessor;

use crate::error::Fault;
use futures::future::BoxFuture;
use rdkafka::message::OwnedMessage;

/// Re-invokes the user handler over a batch of records.
///
/// The worker loop supplies this so the failure machinery can redeliver
/// records in process without reaching back into the consumer.
pub type BatchInvoker =
    Box<dyn FnMut(Vec<OwnedMessage>) -> BoxFuture<'static, Result<(), Fault>> + Send>;
