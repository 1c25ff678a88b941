use hmac::{Hmac, Mac};
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::{Span, SpanKind, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::{KeyValue, Value};
use opentelemetry_remote_sampler::{
    BucketSettings, BucketType, ConfiguredHost, Flags, NoopSamplingMetrics, RemoteSampler,
    RequestHeadersPropagator, ResponseHeadersPropagator, SampleSource, SamplerConfig, Settings,
    SwTraceContextPropagator, TransactionSetting,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
use sha1::Sha1;
use std::collections::HashMap;
use std::time::UNIX_EPOCH;

const KEY: &str = "8mZ98ZnZhhggcsUmdMbS";

struct Harness {
    sampler: RemoteSampler,
    provider: SdkTracerProvider,
    exporter: InMemorySpanExporter,
    propagator: TextMapCompositePropagator,
}

impl Harness {
    fn new(config: SamplerConfig) -> Self {
        let sampler = RemoteSampler::builder()
            .with_host(ConfiguredHost::new(config))
            .with_metrics(NoopSamplingMetrics)
            .build();
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .with_sampler(sampler.clone())
            .build();
        let propagator = TextMapCompositePropagator::new(vec![
            Box::new(SwTraceContextPropagator::new()),
            Box::new(RequestHeadersPropagator::new()),
        ]);
        Harness {
            sampler,
            provider,
            exporter,
            propagator,
        }
    }

    fn with_defaults() -> Self {
        Harness::new(
            SamplerConfig::default()
                .with_tracing_mode(None)
                .with_trigger_trace_enabled(true),
        )
    }

    /// Handle a request with the given headers, returning whether the server
    /// span is recording and sampled along with the response headers.
    fn request(&self, headers: &[(&str, &str)]) -> (bool, bool, HashMap<String, String>) {
        let exchange = self.exchange(headers);
        (exchange.recording, exchange.sampled, exchange.response)
    }

    /// Handle a request with the given headers, making an outgoing request
    /// from a child of the server span.
    fn exchange(&self, headers: &[(&str, &str)]) -> Exchange {
        let headers: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        let cx = self.propagator.extract(&headers);

        let tracer = self.provider.tracer("sampling-test");
        let span = tracer
            .span_builder("GET /users")
            .with_kind(SpanKind::Server)
            .start_with_context(&tracer, &cx);
        let recording = span.is_recording();
        let sampled = span.span_context().is_sampled();

        // children of the server span follow it
        let server_cx = cx.with_span(span);
        let child = tracer.start_with_context("child", &server_cx);
        assert_eq!(child.span_context().is_sampled(), sampled);
        let child_cx = server_cx.with_span(child);

        let mut outgoing = HashMap::new();
        self.propagator.inject_context(&child_cx, &mut outgoing);
        child_cx.span().end();
        server_cx.span().end();

        let mut response = HashMap::new();
        ResponseHeadersPropagator::new().inject_context(&cx, &mut response);
        Exchange {
            recording,
            sampled,
            response,
            outgoing,
        }
    }

    fn exported(&self) -> Vec<opentelemetry_sdk::trace::SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }
}

struct Exchange {
    recording: bool,
    sampled: bool,
    response: HashMap<String, String>,
    outgoing: HashMap<String, String>,
}

fn now() -> u64 {
    opentelemetry::time::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn settings(flags: Flags, sample_rate: u32, buckets: &[(BucketType, f64, f64)]) -> Settings {
    Settings {
        sample_rate,
        sample_source: SampleSource::Remote,
        flags,
        buckets: buckets
            .iter()
            .map(|(t, capacity, rate)| (*t, BucketSettings::new(*capacity, *rate)))
            .collect(),
        signature_key: Some(KEY.as_bytes().to_vec()),
        timestamp: now(),
        ttl: 600,
    }
}

fn sign(header: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(KEY.as_bytes()).unwrap();
    mac.update(header.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a Value> {
    attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

#[test]
fn nothing_is_recorded_without_settings() {
    let harness = Harness::with_defaults();
    let (recording, sampled, response) = harness.request(&[("X-Trace-Options", "trigger-trace")]);
    assert!(!recording);
    assert!(!sampled);
    assert_eq!(
        response.get("x-trace-options-response").map(String::as_str),
        Some("trigger-trace=settings-not-available")
    );
    assert!(harness.exported().is_empty());
}

#[test]
fn dice_roll_samples_and_exports() {
    let harness = Harness::with_defaults();
    harness.sampler.update_settings(settings(
        Flags::SAMPLE_START,
        1_000_000,
        &[(BucketType::Default, 100.0, 100.0)],
    ));

    let (recording, sampled, response) = harness.request(&[]);
    assert!(recording);
    assert!(sampled);
    assert!(response.is_empty());

    let spans = harness.exported();
    assert_eq!(spans.len(), 2);
    let server = spans.iter().find(|s| s.name == "GET /users").unwrap();
    assert_eq!(
        attribute(&server.attributes, "SampleRate"),
        Some(&Value::I64(1_000_000))
    );
    assert_eq!(
        attribute(&server.attributes, "SampleSource"),
        Some(&Value::I64(6))
    );
    assert_eq!(
        attribute(&server.attributes, "BucketCapacity"),
        Some(&Value::F64(100.0))
    );
    // local children bypass sampling entirely
    let child = spans.iter().find(|s| s.name == "child").unwrap();
    assert_eq!(attribute(&child.attributes, "SampleRate"), None);
}

#[test]
fn unsigned_trigger_trace_is_rate_limited() {
    let harness = Harness::with_defaults();
    harness.sampler.update_settings(settings(
        Flags::SAMPLE_START | Flags::TRIGGERED_TRACE,
        0,
        &[
            (BucketType::TriggerStrict, 1.0, 0.0),
            (BucketType::TriggerRelaxed, 10.0, 0.0),
        ],
    ));
    let options = "trigger-trace;custom-user=alice;sw-keys=check-id:1";
    let headers = [("X-Trace-Options", options)];

    let (_, sampled, response) = harness.request(&headers);
    assert!(sampled);
    assert_eq!(
        response.get("x-trace-options-response").map(String::as_str),
        Some("trigger-trace=ok")
    );

    let (recording, sampled, response) = harness.request(&headers);
    assert!(recording);
    assert!(!sampled);
    assert_eq!(
        response.get("x-trace-options-response").map(String::as_str),
        Some("trigger-trace=rate-exceeded")
    );

    let spans = harness.exported();
    let server = spans.iter().find(|s| s.name == "GET /users").unwrap();
    assert_eq!(
        attribute(&server.attributes, "custom-user"),
        Some(&Value::from("alice"))
    );
    assert_eq!(
        attribute(&server.attributes, "SWKeys"),
        Some(&Value::from("check-id:1"))
    );
    assert_eq!(
        attribute(&server.attributes, "BucketCapacity"),
        Some(&Value::F64(1.0))
    );
}

#[test]
fn signed_trigger_trace() {
    let harness = Harness::with_defaults();
    harness.sampler.update_settings(settings(
        Flags::SAMPLE_START | Flags::TRIGGERED_TRACE,
        0,
        &[(BucketType::TriggerRelaxed, 10.0, 0.0)],
    ));

    let header = format!("trigger-trace;ts={};unknown", now());
    let signature = sign(&header);
    let (_, sampled, response) = harness.request(&[
        ("X-Trace-Options", header.as_str()),
        ("X-Trace-Options-Signature", signature.as_str()),
    ]);
    assert!(sampled);
    assert_eq!(
        response.get("x-trace-options-response").map(String::as_str),
        Some("auth=ok;trigger-trace=ok;ignored=unknown")
    );

    let (recording, sampled, response) = harness.request(&[
        ("X-Trace-Options", header.as_str()),
        ("X-Trace-Options-Signature", "bad"),
    ]);
    assert!(!recording);
    assert!(!sampled);
    assert_eq!(
        response.get("x-trace-options-response").map(String::as_str),
        Some("auth=bad-signature")
    );
}

#[test]
fn upstream_decision_is_trusted() {
    let harness = Harness::with_defaults();
    harness.sampler.update_settings(settings(
        Flags::SAMPLE_START | Flags::SAMPLE_THROUGH_ALWAYS,
        0,
        &[],
    ));

    let traceparent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
    let exchange = harness.exchange(&[
        ("traceparent", traceparent),
        ("tracestate", "foo=bar,sw=00f067aa0ba902b7-01"),
    ]);
    assert!(exchange.sampled);

    let spans = harness.exported();
    let server = spans.iter().find(|s| s.name == "GET /users").unwrap();
    assert_eq!(
        attribute(&server.attributes, "sw.tracestate_parent_id"),
        Some(&Value::from("00f067aa0ba902b7"))
    );

    // the outgoing request carries this service's span, not the upstream one
    let child = spans.iter().find(|s| s.name == "child").unwrap();
    let tracestate = format!("sw={}-01,foo=bar", child.span_context.span_id());
    assert_eq!(exchange.outgoing.get("tracestate"), Some(&tracestate));

    let (recording, sampled, _) = harness.request(&[
        ("traceparent", traceparent),
        ("tracestate", "sw=00f067aa0ba902b7-00"),
    ]);
    assert!(recording);
    assert!(!sampled);
}

#[test]
fn transaction_settings_disable_tracing() {
    let setting = TransactionSetting::new(false, "^SERVER:GET /users$").unwrap();
    let harness = Harness::new(
        SamplerConfig::default()
            .with_tracing_mode(None)
            .with_trigger_trace_enabled(true)
            .with_transaction_setting(setting),
    );
    harness.sampler.update_settings(settings(
        Flags::SAMPLE_START | Flags::SAMPLE_THROUGH_ALWAYS,
        1_000_000,
        &[(BucketType::Default, 100.0, 100.0)],
    ));

    let (recording, sampled, response) = harness.request(&[("X-Trace-Options", "trigger-trace")]);
    assert!(!recording);
    assert!(!sampled);
    assert_eq!(
        response.get("x-trace-options-response").map(String::as_str),
        Some("trigger-trace=tracing-disabled")
    );
}

#[test]
fn sampled_decision_chains_across_services() {
    let upstream = Harness::with_defaults();
    upstream.sampler.update_settings(settings(
        Flags::SAMPLE_START,
        1_000_000,
        &[(BucketType::Default, 100.0, 100.0)],
    ));
    let downstream = Harness::with_defaults();
    downstream.sampler.update_settings(settings(
        Flags::SAMPLE_START | Flags::SAMPLE_THROUGH_ALWAYS,
        0,
        &[],
    ));

    let exchange = upstream.exchange(&[]);
    assert!(exchange.sampled);
    let child = upstream
        .exported()
        .into_iter()
        .find(|s| s.name == "child")
        .unwrap();
    let span_id = child.span_context.span_id().to_string();
    assert_eq!(
        exchange.outgoing.get("tracestate"),
        Some(&format!("sw={}-01", span_id))
    );

    let headers: Vec<(&str, &str)> = exchange
        .outgoing
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let (recording, sampled, _) = downstream.request(&headers);
    assert!(recording);
    assert!(sampled);

    let server = downstream
        .exported()
        .into_iter()
        .find(|s| s.name == "GET /users")
        .unwrap();
    assert_eq!(
        server.span_context.trace_id(),
        child.span_context.trace_id()
    );
    assert_eq!(
        attribute(&server.attributes, "sw.tracestate_parent_id"),
        Some(&Value::from(span_id))
    );
}
