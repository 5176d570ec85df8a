//! Topic naming strategies
//!
//! Names must be deterministic given the source topic and hop position:
//! every worker configured alike has to derive the same chain.

use crate::config::{RetryTopicConfig, SuffixStyle};
use std::time::Duration;

/// Derives chain topic names from a source topic.
pub trait TopicNamer: Send + Sync {
    /// Name of the retry hop at `hop` (zero-based), given the cumulative
    /// delay accumulated up to and including that hop.
    fn retry_topic(&self, source: &str, hop: usize, cumulative_delay: Duration) -> String;

    /// Name of the dead-letter topic.
    fn dlt_topic(&self, source: &str) -> String;
}

/// Suffix-based naming: `<source><retry-suffix>-<n>` and `<source><dlt-suffix>`.
#[derive(Debug, Clone)]
pub struct SuffixNamer {
    /// Suffix marking retry hop topics
    pub retry_suffix: String,
    /// Suffix marking the dead-letter topic
    pub dlt_suffix: String,
    /// How `<n>` is derived
    pub style: SuffixStyle,
}

impl Default for SuffixNamer {
    fn default() -> Self {
        Self {
            retry_suffix: "-retry".to_string(),
            dlt_suffix: "-dlt".to_string(),
            style: SuffixStyle::DelayValue,
        }
    }
}

impl SuffixNamer {
    /// Namer using the suffixes and style of the given configuration.
    pub fn from_config(config: &RetryTopicConfig) -> Self {
        Self {
            retry_suffix: config.retry_suffix.clone(),
            dlt_suffix: config.dlt_suffix.clone(),
            style: config.suffix_style,
        }
    }
}

impl TopicNamer for SuffixNamer {
    fn retry_topic(&self, source: &str, hop: usize, cumulative_delay: Duration) -> String {
        let n = match self.style {
            // Cumulative rather than per-hop delay: fixed schedules would
            // otherwise name every hop identically.
            SuffixStyle::DelayValue => cumulative_delay.as_millis().to_string(),
            SuffixStyle::Index => hop.to_string(),
        };
        format!("{}{}-{}", source, self.retry_suffix, n)
    }

    fn dlt_topic(&self, source: &str) -> String {
        format!("{}{}", source, self.dlt_suffix)
    }
}
