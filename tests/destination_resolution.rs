//! Chain construction and resolution wired together the way a worker uses
//! them: one sealed registry serving every chain topic of its sources.

use retry_topics::destination::{build_chain, DestinationResolver, SuffixNamer, TopicKind};
use retry_topics::testing::{record_with_headers, CapturingPublisher, BASE_TIMESTAMP_MS};
use retry_topics::{
    headers, Clock, DltPolicy, Fault, FaultClassifier, ManualClock, RecordPublisher,
    RecoveryOutcome, RecoveryPublisher, RetryTopicConfig, SuffixStyle,
};
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = BASE_TIMESTAMP_MS;

fn sealed_registry(
    sources: &[(&str, &RetryTopicConfig)],
) -> (Arc<DestinationResolver>, Arc<ManualClock>) {
    let clock = ManualClock::at(T0);
    let resolver = Arc::new(DestinationResolver::new(
        Arc::new(FaultClassifier::default()),
        clock.clone() as Arc<dyn Clock>,
    ));
    for (source, config) in sources {
        let chain = build_chain(source, config, &SuffixNamer::from_config(config));
        resolver.register_chain(&chain).unwrap();
    }
    resolver.seal();
    (resolver, clock)
}

fn transient() -> Fault {
    Fault::handler(Fault::Io("connection reset".into()))
}

#[test]
fn exponential_index_chain_walks_every_hop() {
    let config = RetryTopicConfig::builder()
        .max_attempts(4)
        .exponential_delay(Duration::from_secs(1), Duration::from_secs(10))
        .suffix_style(SuffixStyle::Index)
        .build();
    let (resolver, _) = sealed_registry(&[("orders", &config)]);

    let mut visited = vec!["orders".to_string()];
    for attempt in 1..=4 {
        let dest = resolver
            .resolve(visited.last().unwrap(), attempt, &transient(), T0)
            .unwrap();
        visited.push(dest.name.clone());
    }

    assert_eq!(
        visited,
        [
            "orders",
            "orders-retry-0",
            "orders-retry-1",
            "orders-retry-2",
            "orders-dlt",
        ]
    );

    // A failure on the dead letter ends the walk at the sentinel.
    let end = resolver.resolve("orders-dlt", 5, &transient(), T0).unwrap();
    assert!(end.is_no_op());
    assert_eq!(end.name, "orders-dlt-noop");
}

#[test]
fn one_registry_serves_multiple_sources() {
    let orders = RetryTopicConfig::default();
    let payments = RetryTopicConfig::builder()
        .max_attempts(4)
        .exponential_delay(Duration::from_secs(1), Duration::from_secs(10))
        .build();
    let (resolver, _) = sealed_registry(&[("orders", &orders), ("payments", &payments)]);

    assert_eq!(
        resolver.resolve("orders", 1, &transient(), T0).unwrap().name,
        "orders-retry-1000"
    );
    assert_eq!(
        resolver
            .resolve("payments", 1, &transient(), T0)
            .unwrap()
            .name,
        "payments-retry-1000"
    );

    // Each chain advances within itself.
    assert_eq!(
        resolver
            .resolve("payments-retry-1000", 2, &transient(), T0)
            .unwrap()
            .name,
        "payments-retry-3000"
    );

    let hop = resolver.destination_for("payments-retry-3000").unwrap();
    assert_eq!(hop.kind, TopicKind::Retry);
    assert_eq!(hop.delay_ms, 2000);
    assert_eq!(hop.source, "payments");

    assert!(resolver.destination_for("refunds").is_none());
}

#[test]
fn custom_suffixes_flow_through_resolution() {
    let config = RetryTopicConfig::builder()
        .retry_suffix(".redo")
        .dlt_suffix(".dead")
        .suffix_style(SuffixStyle::Index)
        .build();
    let (resolver, _) = sealed_registry(&[("billing.v1", &config)]);

    let first = resolver.resolve("billing.v1", 1, &transient(), T0).unwrap();
    assert_eq!(first.name, "billing.v1.redo-0");

    let second = resolver
        .resolve("billing.v1.redo-0", 2, &transient(), T0)
        .unwrap();
    assert_eq!(second.name, "billing.v1.redo-1");

    let parked = resolver
        .resolve("billing.v1.redo-1", 3, &transient(), T0)
        .unwrap();
    assert_eq!(parked.name, "billing.v1.dead");
    assert!(parked.is_dead_letter());
}

#[tokio::test]
async fn chain_without_dead_letter_halts_recovery() {
    let config = RetryTopicConfig::builder()
        .dlt_policy(DltPolicy::None)
        .build();
    let clock = ManualClock::at(T0);
    let resolver = Arc::new(DestinationResolver::new(
        Arc::new(FaultClassifier::default()),
        clock.clone() as Arc<dyn Clock>,
    ));
    let chain = build_chain("orders", &config, &SuffixNamer::from_config(&config));
    resolver.register_chain(&chain).unwrap();
    resolver.seal();

    let publisher = Arc::new(CapturingPublisher::new());
    let recovery = RecoveryPublisher::new(
        resolver,
        publisher.clone() as Arc<dyn RecordPublisher>,
        clock as Arc<dyn Clock>,
    );

    // Budget exhausted on the last retry hop: no dead letter to park in, so
    // the chain ends without publishing anything.
    let exhausted = record_with_headers(
        "orders-retry-2000",
        0,
        9,
        b"x",
        &[(headers::ATTEMPTS, headers::encode_attempts(3).to_vec())],
    );
    let outcome = recovery.forward(&exhausted, &transient()).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Halted);

    // Same for a fatal fault on the main topic.
    let fatal = Fault::handler(Fault::Deserialization("truncated".into()));
    let first = record_with_headers("orders", 0, 1, b"x", &[]);
    let outcome = recovery.forward(&first, &fatal).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Halted);

    assert!(publisher.sent().is_empty());
}
