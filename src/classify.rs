//! Fatal-fault classification
//!
//! The classifier decides which fault kinds are pointless to redeliver.
//! Faults whose kind is in the fatal set skip every remaining retry hop and
//! go straight to the dead-letter destination.

use crate::error::{Fault, FaultKind};
use parking_lot::RwLock;
use std::collections::HashSet;

/// Mutable set of fault kinds that are never retried.
///
/// Starts with the kinds for which redelivery cannot help: the record's
/// bytes or the handler wiring are wrong, not the downstream state.
#[derive(Debug)]
pub struct FaultClassifier {
    fatal: RwLock<HashSet<FaultKind>>,
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self {
            fatal: RwLock::new(FaultKind::DEFAULT_FATAL.into_iter().collect()),
        }
    }
}

impl FaultClassifier {
    /// Classifier with an empty fatal set: every fault is retryable.
    pub fn retry_all() -> Self {
        Self {
            fatal: RwLock::new(HashSet::new()),
        }
    }

    /// Classifier with exactly the given fatal kinds.
    pub fn with_fatal(kinds: impl IntoIterator<Item = FaultKind>) -> Self {
        Self {
            fatal: RwLock::new(kinds.into_iter().collect()),
        }
    }

    /// Marks a kind as fatal. Returns false if it already was.
    pub fn add_fatal(&self, kind: FaultKind) -> bool {
        self.fatal.write().insert(kind)
    }

    /// Makes a kind retryable again. Returns false if it was not fatal.
    pub fn remove_fatal(&self, kind: FaultKind) -> bool {
        self.fatal.write().remove(&kind)
    }

    /// Whether the fault's underlying kind is fatal.
    pub fn is_fatal(&self, fault: &Fault) -> bool {
        self.is_fatal_kind(fault.kind())
    }

    /// Whether the kind itself is fatal.
    pub fn is_fatal_kind(&self, kind: FaultKind) -> bool {
        self.fatal.read().contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_covers_non_recoverable_kinds() {
        let classifier = FaultClassifier::default();
        assert!(classifier.is_fatal(&Fault::Deserialization("bad".into())));
        assert!(classifier.is_fatal(&Fault::Conversion("bad".into())));
        assert!(classifier.is_fatal(&Fault::PayloadExtraction("bad".into())));
        assert!(classifier.is_fatal(&Fault::MissingHandler("bad".into())));
        assert!(classifier.is_fatal(&Fault::Downcast("bad".into())));
        assert!(!classifier.is_fatal(&Fault::processing("transient")));
        assert!(!classifier.is_fatal(&Fault::Io("transient".into())));
    }

    #[test]
    fn classification_sees_through_wrappers() {
        let classifier = FaultClassifier::default();
        let wrapped = Fault::handler(Fault::timestamped(
            1,
            Fault::Deserialization("bad".into()),
        ));
        assert!(classifier.is_fatal(&wrapped));
    }

    #[test]
    fn fatal_set_is_adjustable() {
        let classifier = FaultClassifier::default();
        assert!(classifier.add_fatal(FaultKind::Timeout));
        assert!(!classifier.add_fatal(FaultKind::Timeout));
        assert!(classifier.is_fatal(&Fault::Timeout("slow".into())));

        assert!(classifier.remove_fatal(FaultKind::Deserialization));
        assert!(!classifier.is_fatal(&Fault::Deserialization("bad".into())));
        assert!(!classifier.remove_fatal(FaultKind::Deserialization));
    }

    #[test]
    fn retry_all_treats_nothing_as_fatal() {
        let classifier = FaultClassifier::retry_all();
        assert!(!classifier.is_fatal(&Fault::Deserialization("bad".into())));
    }
}
