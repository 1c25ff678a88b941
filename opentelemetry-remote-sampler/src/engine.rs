//! # Decision engine
//!
//! Computes a sampling decision for a span from its parent, the trace options
//! request headers, and the current settings. The engine never fails, every
//! combination of inputs resolves to a [`Decision`].
//!
//! Spans with a local parent always follow their parent. For root and entry
//! spans exactly one of four algorithms is selected:
//!
//! * parent-based, when the parent carries a valid `sw` trace state entry
//! * trigger trace, when a trigger trace was requested
//! * dice roll, the default
//! * disabled, when the settings forbid starting traces
use crate::dice::Dice;
use crate::metrics::{SamplingCounter, SamplingMetrics};
use crate::settings::{BucketType, Flags, LocalSettings, Settings, SAMPLE_RATE_SCALE};
use crate::store::SettingsStore;
use crate::trace_options::{
    parse_trace_options, stringify_trace_options_response, validate_signature_at, Auth,
    RequestHeaders, ResponseHeaders, TraceOptions, TraceOptionsResponse, TriggerTrace,
};
use opentelemetry::trace::{TraceContextExt, TraceFlags};
use opentelemetry::{otel_debug, Context, KeyValue};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

/// Key of the trace state entry carrying the upstream sampling decision.
pub const TRACE_STATE_KEY: &str = "sw";

pub(crate) const SW_KEYS_ATTRIBUTE: &str = "SWKeys";
pub(crate) const BUCKET_CAPACITY_ATTRIBUTE: &str = "BucketCapacity";
pub(crate) const BUCKET_RATE_ATTRIBUTE: &str = "BucketRate";
pub(crate) const SAMPLE_RATE_ATTRIBUTE: &str = "SampleRate";
pub(crate) const SAMPLE_SOURCE_ATTRIBUTE: &str = "SampleSource";
pub(crate) const PARENT_ID_ATTRIBUTE: &str = "sw.tracestate_parent_id";

const TRACE_STATE_PATTERN: &str = r"^[0-9a-f]{16}-[0-9a-f]{2}$";
static TRACE_STATE_REGEX: OnceLock<Regex> = OnceLock::new();

/// Returns `true` if `value` is a `<16 hex digit span id>-<2 hex digit flags>` trace state entry.
fn is_valid_trace_state(value: &str) -> bool {
    TRACE_STATE_REGEX
        .get_or_init(|| Regex::new(TRACE_STATE_PATTERN).expect("valid regex"))
        .is_match(value)
}

/// Final sampling decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The span is neither recorded nor exported.
    NotRecord,
    /// The span is recorded but not exported.
    Record,
    /// The span is recorded and exported.
    RecordAndSampled,
}

/// Position of a span in its trace, as seen from this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanType {
    /// No valid parent.
    Root,
    /// Valid parent in another process.
    Entry,
    /// Valid parent in this process.
    Local,
}

/// Description of the parent of the span being sampled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentSpan {
    /// The parent has a valid trace and span id.
    pub valid: bool,
    /// The parent lives in another process.
    pub remote: bool,
    /// The parent is sampled.
    pub sampled: bool,
    /// Value of the parent's `sw` trace state entry.
    pub propagated_tag: Option<String>,
}

impl ParentSpan {
    /// Describe the active span of `cx`, or a missing parent if there is none.
    pub fn from_context(cx: Option<&Context>) -> Self {
        let Some(cx) = cx.filter(|cx| cx.has_active_span()) else {
            return ParentSpan::default();
        };
        let span = cx.span();
        let span_context = span.span_context();
        ParentSpan {
            valid: span_context.is_valid(),
            remote: span_context.is_remote(),
            sampled: span_context.is_sampled(),
            propagated_tag: span_context
                .trace_state()
                .get(TRACE_STATE_KEY)
                .map(ToString::to_string),
        }
    }

    pub fn span_type(&self) -> SpanType {
        if !self.valid {
            SpanType::Root
        } else if self.remote {
            SpanType::Entry
        } else {
            SpanType::Local
        }
    }

    /// The propagated tag of an entry span's parent, if well formed.
    fn sampling_tag(&self) -> Option<&str> {
        if self.span_type() != SpanType::Entry {
            return None;
        }
        self.propagated_tag
            .as_deref()
            .filter(|tag| is_valid_trace_state(tag))
    }
}

/// Result of a sampling decision.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub decision: Decision,
    /// Attributes to add to the span.
    pub attributes: Vec<KeyValue>,
    /// Headers to set on the response of the request that started the trace.
    /// `None` for spans with a local parent, which never touch the response.
    pub response: Option<ResponseHeaders>,
}

struct TraceRequest {
    options: TraceOptions,
    response: TraceOptionsResponse,
}

struct SampleState<'a> {
    decision: Decision,
    attributes: Vec<KeyValue>,
    settings: Settings,
    tag: Option<&'a str>,
    trace: Option<TraceRequest>,
}

impl SampleState<'_> {
    fn trigger_trace_requested(&self) -> bool {
        self.trace
            .as_ref()
            .is_some_and(|trace| trace.options.trigger_trace)
    }

    fn set_trigger_trace(&mut self, trigger_trace: TriggerTrace) {
        if let Some(trace) = self.trace.as_mut() {
            trace.response.trigger_trace = Some(trigger_trace);
        }
    }

    fn signed(&self) -> bool {
        self.trace
            .as_ref()
            .is_some_and(|trace| trace.response.auth == Some(Auth::Ok))
    }
}

/// Makes sampling decisions using the settings of a [`SettingsStore`].
#[derive(Debug)]
pub struct DecisionEngine {
    store: Arc<SettingsStore>,
    metrics: Arc<dyn SamplingMetrics>,
}

impl DecisionEngine {
    pub fn new(store: Arc<SettingsStore>, metrics: Arc<dyn SamplingMetrics>) -> Self {
        DecisionEngine { store, metrics }
    }

    /// The store the engine reads its settings from.
    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    /// Decide whether a span should be recorded and sampled.
    pub fn decide(
        &self,
        parent: &ParentSpan,
        headers: &RequestHeaders,
        local: &LocalSettings,
    ) -> SampleOutcome {
        self.decide_at(parent, headers, local, opentelemetry::time::now())
    }

    pub(crate) fn decide_at(
        &self,
        parent: &ParentSpan,
        headers: &RequestHeaders,
        local: &LocalSettings,
        now: SystemTime,
    ) -> SampleOutcome {
        if parent.span_type() == SpanType::Local {
            let decision = if parent.sampled {
                Decision::RecordAndSampled
            } else {
                Decision::NotRecord
            };
            return SampleOutcome {
                decision,
                attributes: Vec::new(),
                response: None,
            };
        }

        self.metrics.increment(SamplingCounter::RequestCount);

        let settings = self.store.current_at(local, now);

        // empty headers count as absent
        let header = headers.trace_options.as_deref().filter(|h| !h.is_empty());
        let signature = headers
            .trace_options_signature
            .as_deref()
            .filter(|s| !s.is_empty());

        let mut trace = header.map(|header| TraceRequest {
            options: parse_trace_options(header),
            response: TraceOptionsResponse::default(),
        });

        if let (Some(trace), Some(header), Some(signature)) = (trace.as_mut(), header, signature) {
            let key = settings.as_ref().and_then(|s| s.signature_key.as_deref());
            let auth = validate_signature_at(header, signature, key, trace.options.timestamp, now);
            trace.response.auth = Some(auth);

            if auth != Auth::Ok {
                otel_debug!(name: "DecisionEngine.SignatureInvalid", auth = auth.as_str());
                return SampleOutcome {
                    decision: Decision::NotRecord,
                    attributes: Vec::new(),
                    response: Some(response_headers(Some(&trace.response))),
                };
            }
        }

        let mut attributes = Vec::new();
        if let Some(trace) = trace.as_mut() {
            if !trace.options.trigger_trace {
                trace.response.trigger_trace = Some(TriggerTrace::NotRequested);
            }
            if let Some(sw_keys) = &trace.options.sw_keys {
                attributes.push(KeyValue::new(SW_KEYS_ATTRIBUTE, sw_keys.clone()));
            }
            for (k, v) in &trace.options.custom {
                attributes.push(KeyValue::new(k.clone(), v.clone()));
            }
            trace.response.ignored = trace
                .options
                .ignored
                .iter()
                .map(|(k, _)| k.clone())
                .collect();
        }

        let Some(settings) = settings else {
            otel_debug!(name: "DecisionEngine.SettingsUnavailable");
            if let Some(trace) = trace.as_mut() {
                if trace.options.trigger_trace {
                    trace.response.trigger_trace = Some(TriggerTrace::SettingsNotAvailable);
                }
            }
            return SampleOutcome {
                decision: Decision::NotRecord,
                attributes,
                response: Some(response_headers(trace.as_ref().map(|t| &t.response))),
            };
        };

        let mut s = SampleState {
            decision: Decision::NotRecord,
            attributes,
            settings,
            tag: parent.sampling_tag(),
            trace,
        };

        if s.tag.is_some() {
            self.parent_based_algo(&mut s);
        } else if s.settings.flags.contains(Flags::SAMPLE_START) {
            if s.trigger_trace_requested() {
                self.trigger_trace_algo(&mut s);
            } else {
                self.dice_roll_algo(&mut s);
            }
        } else {
            self.disabled_algo(&mut s);
        }

        SampleOutcome {
            decision: s.decision,
            response: Some(response_headers(s.trace.as_ref().map(|t| &t.response))),
            attributes: s.attributes,
        }
    }

    fn parent_based_algo(&self, s: &mut SampleState<'_>) {
        if s.trigger_trace_requested() {
            s.set_trigger_trace(TriggerTrace::Ignored);
        }

        let Some(tag) = s.tag else {
            return;
        };
        if let Some(parent_id) = tag.get(..16) {
            s.attributes
                .push(KeyValue::new(PARENT_ID_ATTRIBUTE, parent_id.to_string()));
        }

        if s.settings.flags.contains(Flags::SAMPLE_THROUGH_ALWAYS) {
            let sampled = tag
                .get(17..)
                .and_then(|flags| u8::from_str_radix(flags, 16).ok())
                .is_some_and(|flags| TraceFlags::new(flags).is_sampled());

            if sampled {
                self.metrics.increment(SamplingCounter::TraceCount);
                self.metrics.increment(SamplingCounter::ThroughTraceCount);
                s.decision = Decision::RecordAndSampled;
            } else {
                s.decision = Decision::Record;
            }
        } else if s.settings.flags.contains(Flags::SAMPLE_START) {
            s.decision = Decision::Record;
        } else {
            s.decision = Decision::NotRecord;
        }
    }

    fn trigger_trace_algo(&self, s: &mut SampleState<'_>) {
        if !s.settings.flags.contains(Flags::TRIGGERED_TRACE) {
            s.set_trigger_trace(TriggerTrace::TriggerTracingDisabled);
            s.decision = Decision::Record;
            return;
        }

        let bucket_type = if s.signed() {
            BucketType::TriggerRelaxed
        } else {
            BucketType::TriggerStrict
        };

        if self.consume(bucket_type, &mut s.attributes) {
            self.metrics.increment(SamplingCounter::TriggeredTraceCount);
            self.metrics.increment(SamplingCounter::TraceCount);
            s.set_trigger_trace(TriggerTrace::Ok);
            s.decision = Decision::RecordAndSampled;
        } else {
            s.set_trigger_trace(TriggerTrace::RateExceeded);
            s.decision = Decision::Record;
        }
    }

    fn dice_roll_algo(&self, s: &mut SampleState<'_>) {
        let dice = Dice::new(SAMPLE_RATE_SCALE, s.settings.sample_rate);
        s.attributes.push(KeyValue::new(SAMPLE_RATE_ATTRIBUTE, i64::from(dice.rate())));
        s.attributes.push(KeyValue::new(
            SAMPLE_SOURCE_ATTRIBUTE,
            s.settings.sample_source.code(),
        ));
        self.metrics.increment(SamplingCounter::SampleCount);

        if !dice.roll() {
            s.decision = Decision::Record;
            return;
        }

        if self.consume(BucketType::Default, &mut s.attributes) {
            self.metrics.increment(SamplingCounter::TraceCount);
            s.decision = Decision::RecordAndSampled;
        } else {
            self.metrics
                .increment(SamplingCounter::TokenBucketExhaustionCount);
            s.decision = Decision::Record;
        }
    }

    fn disabled_algo(&self, s: &mut SampleState<'_>) {
        if s.trigger_trace_requested() {
            s.set_trigger_trace(TriggerTrace::TracingDisabled);
        }

        s.decision = if s.settings.flags.contains(Flags::SAMPLE_THROUGH_ALWAYS) {
            Decision::Record
        } else {
            Decision::NotRecord
        };
    }

    /// Take a token from the given bucket, recording its capacity and rate as attributes.
    fn consume(&self, bucket_type: BucketType, attributes: &mut Vec<KeyValue>) -> bool {
        let Some(bucket) = self.store.bucket(bucket_type) else {
            return false;
        };
        attributes.push(KeyValue::new(BUCKET_CAPACITY_ATTRIBUTE, bucket.capacity()));
        attributes.push(KeyValue::new(BUCKET_RATE_ATTRIBUTE, bucket.rate()));
        bucket.consume(1.0)
    }
}

fn response_headers(response: Option<&TraceOptionsResponse>) -> ResponseHeaders {
    ResponseHeaders {
        trace_options_response: response.map(stringify_trace_options_response),
    }
}
