//! Retry chain construction
//!
//! Expands one source topic into its ordered destination chain:
//! `main → retry hops → dead letter → no-op sentinel`. The dead letter is
//! omitted when the configuration disables it; the sentinel is always last.

use crate::config::{DltPolicy, RetryTopicConfig};
use crate::destination::naming::TopicNamer;
use crate::destination::topic::{DestinationTopic, TopicKind};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FaultKind;

fn topic(
    name: String,
    source: &str,
    kind: TopicKind,
    delay_ms: u64,
    position: usize,
    config: &RetryTopicConfig,
    no_retry_kinds: &HashSet<FaultKind>,
) -> Arc<DestinationTopic> {
    Arc::new(DestinationTopic {
        name,
        source: source.to_string(),
        kind,
        delay_ms,
        position,
        max_attempts: config.max_attempts,
        timeout_ms: config.timeout.map(|t| t.as_millis() as i64),
        always_retry_on_dlt_failure: config.dlt_policy == DltPolicy::AlwaysRetryOnError,
        no_retry_kinds: no_retry_kinds.clone(),
        num_partitions: config.num_partitions,
    })
}

/// Builds the destination chain of one source topic.
///
/// The returned vector is ordered by chain position. Delays come from the
/// configured schedule; names from the namer, with the delay-value style
/// fed the cumulative delay so fixed schedules still produce distinct
/// names.
pub fn build_chain(
    source: &str,
    config: &RetryTopicConfig,
    namer: &dyn TopicNamer,
) -> Vec<Arc<DestinationTopic>> {
    let no_retry_kinds: HashSet<FaultKind> = config.no_retry_kinds.iter().copied().collect();
    let delays = config.delay.series(config.retry_hops());

    let mut chain = Vec::with_capacity(delays.len() + 3);
    chain.push(topic(
        source.to_string(),
        source,
        TopicKind::Main,
        0,
        0,
        config,
        &no_retry_kinds,
    ));

    let mut cumulative = Duration::ZERO;
    for (hop, delay) in delays.iter().enumerate() {
        cumulative += *delay;
        chain.push(topic(
            namer.retry_topic(source, hop, cumulative),
            source,
            TopicKind::Retry,
            delay.as_millis() as u64,
            chain.len(),
            config,
            &no_retry_kinds,
        ));
    }

    if config.dlt_policy != DltPolicy::None {
        chain.push(topic(
            namer.dlt_topic(source),
            source,
            TopicKind::DeadLetter,
            0,
            chain.len(),
            config,
            &no_retry_kinds,
        ));
    }

    let last_name = chain
        .last()
        .map(|t| t.name.clone())
        .unwrap_or_else(|| source.to_string());
    chain.push(topic(
        format!("{}-noop", last_name),
        source,
        TopicKind::NoOp,
        0,
        chain.len(),
        config,
        &no_retry_kinds,
    ));

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuffixStyle;
    use crate::destination::naming::SuffixNamer;
    use pretty_assertions::assert_eq;

    fn names(chain: &[Arc<DestinationTopic>]) -> Vec<&str> {
        chain.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn default_chain_shape() {
        let config = RetryTopicConfig::default();
        let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));

        assert_eq!(
            names(&chain),
            vec![
                "orders",
                "orders-retry-1000",
                "orders-retry-2000",
                "orders-dlt",
                "orders-dlt-noop",
            ]
        );
        assert_eq!(chain[0].kind, TopicKind::Main);
        assert_eq!(chain[1].kind, TopicKind::Retry);
        assert_eq!(chain[2].kind, TopicKind::Retry);
        assert_eq!(chain[3].kind, TopicKind::DeadLetter);
        assert_eq!(chain[4].kind, TopicKind::NoOp);

        // Per-hop delays, not cumulative.
        assert_eq!(chain[1].delay_ms, 1000);
        assert_eq!(chain[2].delay_ms, 1000);
        assert_eq!(chain[3].delay_ms, 0);

        for (position, topic) in chain.iter().enumerate() {
            assert_eq!(topic.position, position);
            assert_eq!(topic.source, "orders");
        }
    }

    #[test]
    fn exponential_chain_uses_schedule_delays() {
        let config = RetryTopicConfig::builder()
            .max_attempts(4)
            .exponential_delay(Duration::from_secs(1), Duration::from_secs(10))
            .build();
        let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));

        assert_eq!(
            names(&chain),
            vec![
                "orders",
                "orders-retry-1000",
                "orders-retry-3000",
                "orders-retry-7000",
                "orders-dlt",
                "orders-dlt-noop",
            ]
        );
        assert_eq!(chain[1].delay_ms, 1000);
        assert_eq!(chain[2].delay_ms, 2000);
        assert_eq!(chain[3].delay_ms, 4000);
    }

    #[test]
    fn index_style_numbers_hops() {
        let config = RetryTopicConfig::builder()
            .suffix_style(SuffixStyle::Index)
            .build();
        let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));
        assert_eq!(
            names(&chain),
            vec![
                "orders",
                "orders-retry-0",
                "orders-retry-1",
                "orders-dlt",
                "orders-dlt-noop",
            ]
        );
    }

    #[test]
    fn chain_without_dead_letter_ends_at_sentinel() {
        let config = RetryTopicConfig::builder()
            .dlt_policy(DltPolicy::None)
            .build();
        let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));
        assert_eq!(
            names(&chain),
            vec![
                "orders",
                "orders-retry-1000",
                "orders-retry-2000",
                "orders-retry-2000-noop",
            ]
        );
        assert!(chain.iter().all(|t| !t.is_dead_letter()));
    }

    #[test]
    fn single_attempt_chain_has_no_retry_hops() {
        let config = RetryTopicConfig::builder().max_attempts(1).build();
        let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));
        assert_eq!(names(&chain), vec!["orders", "orders-dlt", "orders-dlt-noop"]);
    }

    #[test]
    fn chain_carries_config_knobs() {
        let config = RetryTopicConfig::builder()
            .timeout(Duration::from_secs(300))
            .dlt_policy(DltPolicy::AlwaysRetryOnError)
            .no_retry_on(FaultKind::Timeout)
            .num_partitions(12)
            .build();
        let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));

        for topic in &chain {
            assert_eq!(topic.timeout_ms, Some(300_000));
            assert!(topic.always_retry_on_dlt_failure);
            assert!(topic.no_retry_kinds.contains(&FaultKind::Timeout));
            assert_eq!(topic.num_partitions, Some(12));
        }
    }
}
