//! Propagators moving the sampling state in and out of the [`Context`].
//!
//! [`SwTraceContextPropagator`] replaces the SDK's W3C trace context
//! propagator and tags the outgoing `tracestate` with the decision taken for
//! the current span, so that downstream services can trust it.
//! [`RequestHeadersPropagator`] is registered alongside it and stores the
//! incoming `X-Trace-Options` headers in a [`HeaderStorage`].
//! [`ResponseHeadersPropagator`] is only used to write the
//! `X-Trace-Options-Response` header to outgoing responses, never requests.
use crate::engine::TRACE_STATE_KEY;
use crate::host::HeaderStorage;
use crate::trace_options::{
    RequestHeaders, TRACE_OPTIONS_HEADER, TRACE_OPTIONS_RESPONSE_HEADER,
    TRACE_OPTIONS_SIGNATURE_HEADER,
};
use opentelemetry::propagation::{
    text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator,
};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::{otel_debug, Context};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::sync::OnceLock;

const TRACESTATE_HEADER: &str = "tracestate";

static REQUEST_FIELDS: OnceLock<[String; 2]> = OnceLock::new();
#[inline]
fn request_fields() -> &'static [String; 2] {
    REQUEST_FIELDS.get_or_init(|| {
        [
            TRACE_OPTIONS_HEADER.to_owned(),
            TRACE_OPTIONS_SIGNATURE_HEADER.to_owned(),
        ]
    })
}

static RESPONSE_FIELDS: OnceLock<[String; 1]> = OnceLock::new();
#[inline]
fn response_fields() -> &'static [String; 1] {
    RESPONSE_FIELDS.get_or_init(|| [TRACE_OPTIONS_RESPONSE_HEADER.to_owned()])
}

/// The `sw` trace state value describing `span_context`:
/// `<span id>-<trace flags>`, both lowercase hex.
pub fn sw_value(span_context: &SpanContext) -> String {
    format!(
        "{}-{:02x}",
        span_context.span_id(),
        span_context.trace_flags()
    )
}

/// W3C trace context propagator that tags the outgoing `tracestate` with an
/// `sw` entry for the current span.
///
/// Extraction is left to the wrapped [`TraceContextPropagator`]. On injection
/// the `sw` entry of the current span's trace state is inserted or replaced
/// with [`sw_value`], and moved to the front.
///
/// ```
/// use opentelemetry::propagation::TextMapPropagator;
/// use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
/// use opentelemetry::Context;
/// use opentelemetry_remote_sampler::SwTraceContextPropagator;
/// use std::collections::HashMap;
///
/// let cx = Context::new().with_remote_span_context(SpanContext::new(
///     TraceId::from(1_u128),
///     SpanId::from(0x0123_4567_89ab_cdef_u64),
///     TraceFlags::SAMPLED,
///     false,
///     TraceState::default(),
/// ));
///
/// let mut headers = HashMap::new();
/// SwTraceContextPropagator::new().inject_context(&cx, &mut headers);
/// assert_eq!(headers["tracestate"], "sw=0123456789abcdef-01");
/// ```
#[derive(Clone, Debug, Default)]
pub struct SwTraceContextPropagator {
    inner: TraceContextPropagator,
}

impl SwTraceContextPropagator {
    pub fn new() -> Self {
        SwTraceContextPropagator {
            inner: TraceContextPropagator::new(),
        }
    }
}

/// Forwards everything but the `tracestate` header.
struct WithoutTraceState<'a>(&'a mut dyn Injector);

impl Injector for WithoutTraceState<'_> {
    fn set(&mut self, key: &str, value: String) {
        if key != TRACESTATE_HEADER {
            self.0.set(key, value);
        }
    }
}

impl TextMapPropagator for SwTraceContextPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        self.inner
            .inject_context(cx, &mut WithoutTraceState(&mut *injector));

        let span = cx.span();
        let span_context = span.span_context();
        if !span_context.is_valid() {
            return;
        }
        let trace_state = span_context.trace_state();
        let trace_state = match trace_state.insert(TRACE_STATE_KEY, sw_value(span_context)) {
            Ok(trace_state) => trace_state,
            Err(err) => {
                otel_debug!(
                    name: "SwTraceContextPropagator.InvalidTraceState",
                    error = format!("{err}")
                );
                trace_state.clone()
            }
        };
        injector.set(TRACESTATE_HEADER, trace_state.header());
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.inner.extract_with_context(cx, extractor)
    }

    fn fields(&self) -> FieldIter<'_> {
        self.inner.fields()
    }
}

/// Extracts the trace options request headers into a [`HeaderStorage`].
///
/// Repeated `X-Trace-Options` headers are joined with `;`, only the first
/// `X-Trace-Options-Signature` header is kept.
///
/// ```
/// use opentelemetry::propagation::TextMapPropagator;
/// use opentelemetry_remote_sampler::{HeaderStorage, RequestHeadersPropagator};
/// use std::collections::HashMap;
///
/// let mut headers = HashMap::new();
/// headers.insert("x-trace-options".to_string(), "trigger-trace".to_string());
///
/// let cx = RequestHeadersPropagator::new().extract(&headers);
/// let storage = cx.get::<HeaderStorage>().unwrap();
/// assert_eq!(storage.request().trace_options.as_deref(), Some("trigger-trace"));
/// ```
#[derive(Debug, Default)]
pub struct RequestHeadersPropagator {
    _private: (),
}

impl RequestHeadersPropagator {
    pub fn new() -> Self {
        RequestHeadersPropagator { _private: () }
    }
}

impl TextMapPropagator for RequestHeadersPropagator {
    /// Request headers are never injected.
    fn inject_context(&self, _cx: &Context, _injector: &mut dyn Injector) {}

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        let trace_options = extractor
            .get_all(&TRACE_OPTIONS_HEADER.to_lowercase())
            .map(|values| {
                values
                    .iter()
                    .map(|value| value.to_string())
                    .collect::<Vec<_>>()
                    .join(";")
            })
            .filter(|value| !value.is_empty());
        let trace_options_signature = extractor
            .get(&TRACE_OPTIONS_SIGNATURE_HEADER.to_lowercase())
            .map(|value| value.to_string())
            .filter(|value| !value.is_empty());

        cx.with_value(HeaderStorage::new(RequestHeaders {
            trace_options,
            trace_options_signature,
        }))
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(request_fields())
    }
}

/// Injects the response headers stored in the [`HeaderStorage`] of the context.
#[derive(Debug, Default)]
pub struct ResponseHeadersPropagator {
    _private: (),
}

impl ResponseHeadersPropagator {
    pub fn new() -> Self {
        ResponseHeadersPropagator { _private: () }
    }
}

impl TextMapPropagator for ResponseHeadersPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let Some(storage) = cx.get::<HeaderStorage>() else {
            return;
        };
        if let Some(value) = storage.response().trace_options_response {
            if !value.is_empty() {
                injector.set(TRACE_OPTIONS_RESPONSE_HEADER, value);
            }
        }
    }

    /// Response headers are never extracted.
    fn extract_with_context(&self, cx: &Context, _extractor: &dyn Extractor) -> Context {
        cx.clone()
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(response_fields())
    }
}
