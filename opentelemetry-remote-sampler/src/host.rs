//! Integration points between the decision engine and its environment.
//!
//! A [`SamplerHost`] provides the per span local settings and the trace
//! options request headers, and receives the response headers produced by a
//! decision. [`ConfiguredHost`] implements it on top of a [`SamplerConfig`]
//! and the [`HeaderStorage`] placed in the context by
//! [`RequestHeadersPropagator`](crate::RequestHeadersPropagator).
use crate::config::SamplerConfig;
use crate::settings::LocalSettings;
use crate::trace_options::{RequestHeaders, ResponseHeaders};
use opentelemetry::trace::{Link, SpanKind, TraceId};
use opentelemetry::{Context, Key, KeyValue};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

const HTTP_SCHEME: Key = Key::from_static_str("http.scheme");
const NET_HOST_NAME: Key = Key::from_static_str("net.host.name");
const HTTP_TARGET: Key = Key::from_static_str("http.target");

/// Arguments of a sampling decision, as received by the sampler.
#[derive(Clone, Copy, Debug)]
pub struct SampleParams<'a> {
    pub parent_context: Option<&'a Context>,
    pub trace_id: TraceId,
    pub name: &'a str,
    pub span_kind: &'a SpanKind,
    pub attributes: &'a [KeyValue],
    pub links: &'a [Link],
}

impl SampleParams<'_> {
    /// Identifier of the transaction the span belongs to.
    ///
    /// `scheme://host/target` for HTTP server spans carrying the matching
    /// attributes, `KIND:name` otherwise.
    pub fn transaction_identifier(&self) -> String {
        let attribute = |key: &Key| {
            self.attributes
                .iter()
                .find(|kv| &kv.key == key)
                .map(|kv| kv.value.as_str())
        };

        match (
            attribute(&HTTP_SCHEME),
            attribute(&NET_HOST_NAME),
            attribute(&HTTP_TARGET),
        ) {
            (Some(scheme), Some(host), Some(target))
                if !scheme.is_empty() && !host.is_empty() && !target.is_empty() =>
            {
                format!("{}://{}{}", scheme, host, target)
            }
            _ => format!("{}:{}", span_kind_name(self.span_kind), self.name),
        }
    }
}

fn span_kind_name(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "CLIENT",
        SpanKind::Server => "SERVER",
        SpanKind::Producer => "PRODUCER",
        SpanKind::Consumer => "CONSUMER",
        SpanKind::Internal => "INTERNAL",
    }
}

/// Environment specific parts of a sampler.
pub trait SamplerHost: fmt::Debug + Send + Sync {
    /// Local settings to merge with the remote settings for this span.
    fn local_settings(&self, params: &SampleParams<'_>) -> LocalSettings;

    /// Trace options headers of the request that started this span.
    fn request_headers(&self, params: &SampleParams<'_>) -> RequestHeaders;

    /// Headers to set on the response of the request that started this span.
    fn set_response_headers(&self, headers: ResponseHeaders, params: &SampleParams<'_>);
}

/// Request and response headers of the request being traced.
///
/// Stored in the [`Context`] when extracting the request headers and read back
/// when injecting the response headers. Clones share the response headers.
#[derive(Clone, Debug, Default)]
pub struct HeaderStorage {
    request: RequestHeaders,
    response: Arc<Mutex<ResponseHeaders>>,
}

impl HeaderStorage {
    pub fn new(request: RequestHeaders) -> Self {
        HeaderStorage {
            request,
            response: Arc::new(Mutex::new(ResponseHeaders::default())),
        }
    }

    pub fn request(&self) -> &RequestHeaders {
        &self.request
    }

    pub fn response(&self) -> ResponseHeaders {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the present response headers, absent ones are left untouched.
    pub fn set_response(&self, headers: ResponseHeaders) {
        let mut response = self.response.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = headers.trace_options_response {
            response.trace_options_response = Some(value);
        }
    }
}

/// A [`SamplerHost`] backed by a [`SamplerConfig`] and the [`HeaderStorage`]
/// of the parent context.
#[derive(Clone, Debug)]
pub struct ConfiguredHost {
    config: SamplerConfig,
}

impl ConfiguredHost {
    pub fn new(config: SamplerConfig) -> Self {
        ConfiguredHost { config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl Default for ConfiguredHost {
    fn default() -> Self {
        ConfiguredHost::new(SamplerConfig::default())
    }
}

impl SamplerHost for ConfiguredHost {
    fn local_settings(&self, params: &SampleParams<'_>) -> LocalSettings {
        self.config.local_settings(&params.transaction_identifier())
    }

    fn request_headers(&self, params: &SampleParams<'_>) -> RequestHeaders {
        params
            .parent_context
            .and_then(|cx| cx.get::<HeaderStorage>())
            .map(|storage| storage.request().clone())
            .unwrap_or_default()
    }

    fn set_response_headers(&self, headers: ResponseHeaders, params: &SampleParams<'_>) {
        if let Some(storage) = params
            .parent_context
            .and_then(|cx| cx.get::<HeaderStorage>())
        {
            storage.set_response(headers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionSetting;
    use crate::settings::TracingMode;

    fn params<'a>(
        cx: Option<&'a Context>,
        name: &'a str,
        kind: &'a SpanKind,
        attributes: &'a [KeyValue],
    ) -> SampleParams<'a> {
        SampleParams {
            parent_context: cx,
            trace_id: TraceId::from(1_u128),
            name,
            span_kind: kind,
            attributes,
            links: &[],
        }
    }

    #[test]
    fn transaction_identifier() {
        let http = [
            KeyValue::new("http.scheme", "https"),
            KeyValue::new("net.host.name", "example.com"),
            KeyValue::new("http.target", "/users?id=1"),
        ];
        assert_eq!(
            params(None, "GET", &SpanKind::Server, &http).transaction_identifier(),
            "https://example.com/users?id=1"
        );

        let partial = [KeyValue::new("http.scheme", "https")];
        assert_eq!(
            params(None, "GET /users", &SpanKind::Server, &partial).transaction_identifier(),
            "SERVER:GET /users"
        );
        assert_eq!(
            params(None, "job", &SpanKind::Internal, &[]).transaction_identifier(),
            "INTERNAL:job"
        );
    }

    #[test]
    fn local_settings_from_config() {
        let config = SamplerConfig::default()
            .with_tracing_mode(None)
            .with_trigger_trace_enabled(false)
            .with_transaction_setting(TransactionSetting::new(false, "^CLIENT:").unwrap());
        let host = ConfiguredHost::new(config);

        let local = host.local_settings(&params(None, "fetch", &SpanKind::Client, &[]));
        assert_eq!(local.tracing_mode, Some(TracingMode::Never));
        assert!(!local.trigger_mode);

        let local = host.local_settings(&params(None, "fetch", &SpanKind::Server, &[]));
        assert_eq!(local.tracing_mode, None);
    }

    #[test]
    fn headers_round_trip_through_context() {
        let host = ConfiguredHost::new(SamplerConfig::default());
        let request = RequestHeaders {
            trace_options: Some("trigger-trace".to_string()),
            trace_options_signature: None,
        };
        let storage = HeaderStorage::new(request.clone());
        let cx = Context::new().with_value(storage.clone());
        let p = params(Some(&cx), "span", &SpanKind::Server, &[]);

        assert_eq!(host.request_headers(&p), request);

        host.set_response_headers(
            ResponseHeaders {
                trace_options_response: Some("trigger-trace=ok".to_string()),
            },
            &p,
        );
        host.set_response_headers(ResponseHeaders::default(), &p);
        assert_eq!(
            storage.response().trace_options_response.as_deref(),
            Some("trigger-trace=ok")
        );
    }

    #[test]
    fn missing_storage_is_ignored() {
        let host = ConfiguredHost::new(SamplerConfig::default());
        let cx = Context::new();
        let p = params(Some(&cx), "span", &SpanKind::Server, &[]);
        assert_eq!(host.request_headers(&p), RequestHeaders::default());
        host.set_response_headers(
            ResponseHeaders {
                trace_options_response: Some("auth=ok".to_string()),
            },
            &p,
        );
        let p = params(None, "span", &SpanKind::Server, &[]);
        assert_eq!(host.request_headers(&p), RequestHeaders::default());
    }
}
