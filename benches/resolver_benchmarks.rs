//! Benchmarks for the per-failure hot path: destination resolution, header
//! codecs and a full forward through the recovery publisher.

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use retry_topics::destination::{build_chain, DestinationResolver, SuffixNamer};
use retry_topics::testing::{record, BASE_TIMESTAMP_MS};
use retry_topics::{
    headers, Clock, Fault, FaultClassifier, OutboundRecord, RecordPublisher, RecoveryPublisher,
    RetryResult, RetryTopicConfig, SystemClock,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct Discard;

#[async_trait]
impl RecordPublisher for Discard {
    async fn send(&self, _record: OutboundRecord) -> RetryResult<()> {
        Ok(())
    }
}

fn sealed_resolver(config: &RetryTopicConfig) -> Arc<DestinationResolver> {
    let resolver = Arc::new(DestinationResolver::new(
        Arc::new(FaultClassifier::default()),
        Arc::new(SystemClock) as Arc<dyn Clock>,
    ));
    let chain = build_chain("orders", config, &SuffixNamer::from_config(config));
    resolver.register_chain(&chain).unwrap();
    resolver.seal();
    resolver
}

fn benchmark_chain_build(c: &mut Criterion) {
    let fixed = RetryTopicConfig::default();
    c.bench_function("chain_build_fixed", |b| {
        b.iter(|| {
            black_box(build_chain(
                black_box("orders"),
                &fixed,
                &SuffixNamer::from_config(&fixed),
            ));
        });
    });

    let exponential = RetryTopicConfig::builder()
        .max_attempts(6)
        .exponential_delay(Duration::from_secs(1), Duration::from_secs(60))
        .build();
    c.bench_function("chain_build_exponential", |b| {
        b.iter(|| {
            black_box(build_chain(
                black_box("orders"),
                &exponential,
                &SuffixNamer::from_config(&exponential),
            ));
        });
    });
}

fn benchmark_resolution(c: &mut Criterion) {
    let resolver = sealed_resolver(&RetryTopicConfig::default());
    let transient = Fault::handler(Fault::processing("downstream unavailable"));
    let fatal = Fault::handler(Fault::Deserialization("truncated".into()));

    c.bench_function("resolve_main_hop", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .resolve(black_box("orders"), 1, &transient, BASE_TIMESTAMP_MS)
                    .unwrap(),
            );
        });
    });

    c.bench_function("resolve_retry_hop", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .resolve(black_box("orders-retry-1000"), 2, &transient, BASE_TIMESTAMP_MS)
                    .unwrap(),
            );
        });
    });

    c.bench_function("resolve_fatal", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .resolve(black_box("orders"), 1, &fatal, BASE_TIMESTAMP_MS)
                    .unwrap(),
            );
        });
    });
}

fn benchmark_header_codec(c: &mut Criterion) {
    c.bench_function("attempts_codec", |b| {
        b.iter(|| {
            let encoded = headers::encode_attempts(black_box(7));
            black_box(headers::decode_attempts(&encoded));
        });
    });

    c.bench_function("timestamp_codec", |b| {
        b.iter(|| {
            let encoded = headers::encode_timestamp(black_box(BASE_TIMESTAMP_MS));
            black_box(headers::decode_timestamp(&encoded));
        });
    });
}

fn benchmark_forward(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let resolver = sealed_resolver(&RetryTopicConfig::default());
    let recovery = RecoveryPublisher::new(
        resolver,
        Arc::new(Discard) as Arc<dyn RecordPublisher>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
    )
    .with_group_id("orders-workers");
    let inbound = record("orders", 3, 42, br#"{"id":7}"#);
    let fault = Fault::handler(Fault::processing("downstream unavailable"));

    c.bench_function("forward_one_hop", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(recovery.forward(black_box(&inbound), &fault).await.unwrap())
            })
        });
    });
}

criterion_group!(
    benches,
    benchmark_chain_build,
    benchmark_resolution,
    benchmark_header_codec,
    benchmark_forward
);
criterion_main!(benches);
