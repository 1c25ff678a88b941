/*
    Measures sampling decisions per second for root spans with a 50% sample
    rate and a default bucket refilling at 100k tokens per second, so the
    sampled share settles well below 50% once the bucket runs dry.

    Run with `cargo run --release --bin sampling`.
*/

use opentelemetry::trace::{SamplingDecision, SpanKind, TraceId};
use opentelemetry::{Context, KeyValue};
use opentelemetry_remote_sampler::{
    BucketSettings, BucketType, ConfiguredHost, Flags, HeaderStorage, NoopSamplingMetrics,
    RemoteSampler, RequestHeaders, SampleSource, SamplerConfig, Settings,
};
use opentelemetry_sdk::trace::ShouldSample;
use std::collections::HashMap;
use std::time::UNIX_EPOCH;

mod throughput;

fn main() {
    let sampler = RemoteSampler::builder()
        .with_host(ConfiguredHost::new(
            SamplerConfig::default()
                .with_tracing_mode(None)
                .with_trigger_trace_enabled(true),
        ))
        .with_metrics(NoopSamplingMetrics)
        .build();
    sampler.update_settings(settings());

    let cx = Context::new().with_value(HeaderStorage::new(RequestHeaders::default()));
    let attributes = [
        KeyValue::new("http.scheme", "https"),
        KeyValue::new("net.host.name", "example.com"),
        KeyValue::new("http.target", "/users"),
    ];

    throughput::test_throughput(move || {
        let result = sampler.should_sample(
            Some(&cx),
            TraceId::from(1u128),
            "GET /users",
            &SpanKind::Server,
            &attributes,
            &[],
        );
        result.decision == SamplingDecision::RecordAndSample
    });
}

fn settings() -> Settings {
    let timestamp = opentelemetry::time::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    Settings {
        sample_rate: 500_000,
        sample_source: SampleSource::Remote,
        flags: Flags::SAMPLE_START | Flags::SAMPLE_THROUGH_ALWAYS,
        buckets: HashMap::from([(
            BucketType::Default,
            BucketSettings::new(100_000.0, 100_000.0),
        )]),
        signature_key: None,
        timestamp,
        ttl: 24 * 60 * 60,
    }
}
