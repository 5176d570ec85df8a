//! Destination resolution
//!
//! Maps (current topic, attempts so far, fault, original timestamp) to the
//! next destination of the chain. Resolution is pure given the registry and
//! the clock: no side effects, so callers can resolve speculatively.

use crate::classify::FaultClassifier;
use crate::clock::Clock;
use crate::destination::topic::DestinationTopic;
use crate::error::{Fault, RetryError, RetryResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct DestinationHolder {
    source: Arc<DestinationTopic>,
    next: Arc<DestinationTopic>,
    dlt: Option<Arc<DestinationTopic>>,
    no_op: Arc<DestinationTopic>,
}

/// Registry of destination chains plus the routing decision over them.
///
/// Chains are registered during wiring and the registry is then sealed;
/// late registrations fail rather than race the consumers.
pub struct DestinationResolver {
    chains: RwLock<HashMap<String, DestinationHolder>>,
    sealed: AtomicBool,
    classifier: Arc<FaultClassifier>,
    clock: Arc<dyn Clock>,
}

impl DestinationResolver {
    /// Creates an empty registry.
    pub fn new(classifier: Arc<FaultClassifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            classifier,
            clock,
        }
    }

    /// The classifier consulted during resolution.
    pub fn classifier(&self) -> &FaultClassifier {
        &self.classifier
    }

    /// Registers every topic of a chain, keyed by topic name.
    ///
    /// Re-registering a source topic before sealing replaces its chain.
    pub fn register_chain(&self, chain: &[Arc<DestinationTopic>]) -> RetryResult<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(RetryError::RegistrySealed);
        }
        let last = chain
            .last()
            .ok_or_else(|| RetryError::Config("destination chain cannot be empty".to_string()))?;
        if !last.is_no_op() {
            return Err(RetryError::Config(format!(
                "destination chain for '{}' must end with the no-op sentinel",
                last.source
            )));
        }

        let no_op = last.clone();
        let dlt = chain.iter().find(|t| t.is_dead_letter()).cloned();

        let mut chains = self.chains.write();
        if chains.contains_key(&chain[0].name) {
            warn!(
                source = %chain[0].name,
                "replacing previously registered destination chain"
            );
        }
        for (i, topic) in chain.iter().enumerate() {
            let next = chain.get(i + 1).unwrap_or(topic).clone();
            chains.insert(
                topic.name.clone(),
                DestinationHolder {
                    source: topic.clone(),
                    next,
                    dlt: dlt.clone(),
                    no_op: no_op.clone(),
                },
            );
        }
        Ok(())
    }

    /// Seals the registry; later registrations fail with `RegistrySealed`.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        info!(
            topics = self.chains.read().len(),
            "destination registry sealed"
        );
    }

    /// Whether the registry has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// The registered destination for a topic name, if any.
    pub fn destination_for(&self, topic: &str) -> Option<Arc<DestinationTopic>> {
        self.chains.read().get(topic).map(|h| h.source.clone())
    }

    /// Resolves the destination for a record of `topic` that failed with
    /// `fault` after `attempt` deliveries, first delivered at
    /// `original_timestamp_ms`.
    pub fn resolve(
        &self,
        topic: &str,
        attempt: i32,
        fault: &Fault,
        original_timestamp_ms: i64,
    ) -> RetryResult<Arc<DestinationTopic>> {
        let chains = self.chains.read();
        let holder = chains
            .get(topic)
            .ok_or_else(|| RetryError::UnknownTopic(topic.to_string()))?;
        let source = &holder.source;

        if source.is_no_op() {
            return Ok(source.clone());
        }

        if self.past_timeout(source, original_timestamp_ms) {
            debug!(
                topic,
                original_timestamp_ms, "retry timeout elapsed, giving up on the chain"
            );
            if source.is_dead_letter() {
                return Ok(holder.no_op.clone());
            }
            return Ok(self.dlt_or_no_op(holder));
        }

        if source.is_dead_letter() {
            return if source.always_retry_on_dlt_failure && !self.classifier.is_fatal(fault) {
                warn!(topic, "dead-letter processing failed, republishing to it");
                Ok(source.clone())
            } else {
                Ok(holder.no_op.clone())
            };
        }

        let kind = fault.kind();
        if self.classifier.is_fatal_kind(kind) || !source.should_retry_on(attempt, kind) {
            debug!(topic, attempt, kind = ?kind, "fault not retryable, routing to dead letter");
            return Ok(self.dlt_or_no_op(holder));
        }

        debug!(topic, attempt, next = %holder.next, "advancing one retry hop");
        Ok(holder.next.clone())
    }

    fn past_timeout(&self, topic: &DestinationTopic, original_timestamp_ms: i64) -> bool {
        match topic.timeout_ms {
            Some(timeout) => self.clock.now_millis() - original_timestamp_ms >= timeout,
            None => false,
        }
    }

    fn dlt_or_no_op(&self, holder: &DestinationHolder) -> Arc<DestinationTopic> {
        holder
            .dlt
            .clone()
            .unwrap_or_else(|| holder.no_op.clone())
    }
}
