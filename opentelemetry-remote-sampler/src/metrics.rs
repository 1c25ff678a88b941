//! Counters incremented by sampling decisions.
use opentelemetry::metrics::{Counter, Meter};
use std::fmt;

/// Name of the meter used by [`OtelSamplingMetrics::default`].
pub const METER_NAME: &str = "sw.apm.sampling.metrics";

/// Counters incremented while making sampling decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplingCounter {
    /// Number of root and entry spans a decision was made for.
    RequestCount,
    /// Number of dice roll successes that found the default bucket empty.
    TokenBucketExhaustionCount,
    /// Number of traces sampled.
    TraceCount,
    /// Number of dice rolls.
    SampleCount,
    /// Number of traces sampled because the upstream service sampled them.
    ThroughTraceCount,
    /// Number of traces sampled because of a trigger trace request.
    TriggeredTraceCount,
}

impl SamplingCounter {
    /// All the counters.
    pub const ALL: [SamplingCounter; 6] = [
        SamplingCounter::RequestCount,
        SamplingCounter::TokenBucketExhaustionCount,
        SamplingCounter::TraceCount,
        SamplingCounter::SampleCount,
        SamplingCounter::ThroughTraceCount,
        SamplingCounter::TriggeredTraceCount,
    ];

    /// Instrument name of the counter.
    pub fn name(&self) -> &'static str {
        match self {
            SamplingCounter::RequestCount => "trace.service.request_count",
            SamplingCounter::TokenBucketExhaustionCount => {
                "trace.service.tokenbucket_exhaustion_count"
            }
            SamplingCounter::TraceCount => "trace.service.tracecount",
            SamplingCounter::SampleCount => "trace.service.samplecount",
            SamplingCounter::ThroughTraceCount => "trace.service.through_trace_count",
            SamplingCounter::TriggeredTraceCount => "trace.service.triggered_trace_count",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            SamplingCounter::RequestCount => "Count of all requests.",
            SamplingCounter::TokenBucketExhaustionCount => {
                "Count of requests that were not traced due to token bucket rate limiting."
            }
            SamplingCounter::TraceCount => "Count of all traces.",
            SamplingCounter::SampleCount => {
                "Count of requests that went through sampling, which excludes those with a valid upstream decision or trigger traced."
            }
            SamplingCounter::ThroughTraceCount => {
                "Count of requests with a valid upstream decision, thus passed through sampling."
            }
            SamplingCounter::TriggeredTraceCount => "Count of triggered traces.",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Sink for sampling counters.
pub trait SamplingMetrics: fmt::Debug + Send + Sync {
    /// Add one to the given counter.
    fn increment(&self, counter: SamplingCounter);
}

/// Reports sampling counters as OpenTelemetry `u64` counters.
#[derive(Clone)]
pub struct OtelSamplingMetrics {
    counters: [Counter<u64>; 6],
}

impl OtelSamplingMetrics {
    /// Create the counters using the given meter.
    pub fn new(meter: &Meter) -> Self {
        let counters = SamplingCounter::ALL.map(|counter| {
            meter
                .u64_counter(counter.name())
                .with_description(counter.description())
                .build()
        });
        OtelSamplingMetrics { counters }
    }
}

impl Default for OtelSamplingMetrics {
    /// Uses the [`METER_NAME`] meter of the global meter provider.
    fn default() -> Self {
        OtelSamplingMetrics::new(&opentelemetry::global::meter(METER_NAME))
    }
}

impl fmt::Debug for OtelSamplingMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelSamplingMetrics")
            .finish_non_exhaustive()
    }
}

impl SamplingMetrics for OtelSamplingMetrics {
    fn increment(&self, counter: SamplingCounter) {
        self.counters[counter.index()].add(1, &[]);
    }
}

/// Discards every increment.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSamplingMetrics;

impl SamplingMetrics for NoopSamplingMetrics {
    fn increment(&self, _counter: SamplingCounter) {}
}
