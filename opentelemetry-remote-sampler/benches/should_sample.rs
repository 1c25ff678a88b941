use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_remote_sampler::{
    parse_trace_options, BucketSettings, BucketType, ConfiguredHost, Flags, HeaderStorage,
    NoopSamplingMetrics, RemoteSampler, RequestHeaders, SampleSource, SamplerConfig, Settings,
};
use opentelemetry_sdk::trace::ShouldSample;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

fn criterion_benchmark(c: &mut Criterion) {
    benchmark_group(c, BenchmarkParameter::Root);
    benchmark_group(c, BenchmarkParameter::TriggerTrace);
    benchmark_group(c, BenchmarkParameter::Entry);
    benchmark_group(c, BenchmarkParameter::Local);

    let mut group = c.benchmark_group("trace-options");
    group.bench_function("parse", |b| {
        b.iter(|| {
            black_box(parse_trace_options(
                "trigger-trace;sw-keys=lo:se,check-id:123;custom-user=alice;ts=1564597681;foo",
            ))
        })
    });
    group.finish();
}

fn benchmark_group(c: &mut Criterion, p: BenchmarkParameter) {
    let sampler = RemoteSampler::builder()
        .with_host(ConfiguredHost::new(
            SamplerConfig::default()
                .with_tracing_mode(None)
                .with_trigger_trace_enabled(true),
        ))
        .with_metrics(NoopSamplingMetrics)
        .build();
    let cx = p.parent();

    let mut group = c.benchmark_group("should_sample");

    group.bench_function(BenchmarkId::new("no-settings", p), |b| {
        b.iter(|| black_box(sample(&sampler, &cx)))
    });

    sampler.update_settings(settings());
    group.bench_function(BenchmarkId::new("with-settings", p), |b| {
        b.iter(|| black_box(sample(&sampler, &cx)))
    });

    group.finish();
}

fn sample(sampler: &RemoteSampler, cx: &Context) -> opentelemetry::trace::SamplingResult {
    sampler.should_sample(
        Some(cx),
        TraceId::from_u128(1),
        "GET /users",
        &SpanKind::Server,
        &[] as &[KeyValue],
        &[],
    )
}

fn settings() -> Settings {
    let timestamp = opentelemetry::time::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    // buckets large enough to never run dry during a measurement
    let bucket = BucketSettings::new(1e9, 1e9);
    Settings {
        sample_rate: 500_000,
        sample_source: SampleSource::Remote,
        flags: Flags::SAMPLE_START | Flags::SAMPLE_THROUGH_ALWAYS | Flags::TRIGGERED_TRACE,
        buckets: HashMap::from([
            (BucketType::Default, bucket),
            (BucketType::TriggerRelaxed, bucket),
            (BucketType::TriggerStrict, bucket),
        ]),
        signature_key: None,
        timestamp,
        ttl: 3600,
    }
}

#[derive(Copy, Clone)]
enum BenchmarkParameter {
    Root,
    TriggerTrace,
    Entry,
    Local,
}

impl BenchmarkParameter {
    fn parent(self) -> Context {
        let span_context = |is_remote, trace_state: &str| {
            SpanContext::new(
                TraceId::from_u128(1),
                SpanId::from_u64(1),
                TraceFlags::SAMPLED,
                is_remote,
                TraceState::from_str(trace_state).unwrap(),
            )
        };
        let headers = |trace_options: Option<&str>| {
            HeaderStorage::new(RequestHeaders {
                trace_options: trace_options.map(str::to_string),
                trace_options_signature: None,
            })
        };
        let trigger_trace = headers(Some("trigger-trace;custom-user=alice;sw-keys=lo:se"));
        let entry = span_context(true, "sw=0123456789abcdef-01");
        let local = span_context(false, "");

        match self {
            BenchmarkParameter::Root => Context::new().with_value(headers(None)),
            BenchmarkParameter::TriggerTrace => Context::new().with_value(trigger_trace),
            BenchmarkParameter::Entry => Context::new()
                .with_remote_span_context(entry)
                .with_value(headers(None)),
            BenchmarkParameter::Local => Context::new().with_remote_span_context(local),
        }
    }
}

impl Display for BenchmarkParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkParameter::Root => write!(f, "root"),
            BenchmarkParameter::TriggerTrace => write!(f, "trigger-trace"),
            BenchmarkParameter::Entry => write!(f, "entry"),
            BenchmarkParameter::Local => write!(f, "local"),
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
