//! The [`ShouldSample`] implementation plugged into the SDK tracer provider.
use crate::engine::{Decision, DecisionEngine, ParentSpan};
use crate::host::{ConfiguredHost, SampleParams, SamplerHost};
use crate::metrics::{OtelSamplingMetrics, SamplingMetrics};
use crate::settings::Settings;
use crate::store::SettingsStore;
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::ShouldSample;
use std::fmt;
use std::sync::Arc;

struct SamplerInner {
    engine: DecisionEngine,
    host: Box<dyn SamplerHost>,
}

/// A sampler driven by remotely distributed settings.
///
/// Settings are pushed with [`RemoteSampler::update_settings`], usually by a
/// [`FileSettingsRefresher`](crate::FileSettingsRefresher). Until settings are
/// available, and once they expire, no span is recorded.
///
/// Clones share the same settings, token buckets and host.
///
/// ```
/// use opentelemetry_remote_sampler::RemoteSampler;
/// use opentelemetry_sdk::trace::SdkTracerProvider;
///
/// let sampler = RemoteSampler::builder().build();
/// let provider = SdkTracerProvider::builder()
///     .with_sampler(sampler.clone())
///     .build();
/// # drop(provider);
/// ```
#[derive(Clone)]
pub struct RemoteSampler {
    inner: Arc<SamplerInner>,
}

impl fmt::Debug for RemoteSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSampler")
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

impl RemoteSampler {
    /// Create a builder with a [`ConfiguredHost`] read from the environment
    /// and counters reported to the global meter provider.
    pub fn builder() -> RemoteSamplerBuilder {
        RemoteSamplerBuilder::default()
    }

    /// Store new settings if they are newer than the current ones.
    pub fn update_settings(&self, settings: Settings) -> bool {
        self.inner.engine.store().update(settings)
    }

    /// The settings store shared by all clones of this sampler.
    pub fn store(&self) -> &Arc<SettingsStore> {
        self.inner.engine.store()
    }
}

impl ShouldSample for RemoteSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let params = SampleParams {
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        };

        let parent = ParentSpan::from_context(parent_context);
        let headers = self.inner.host.request_headers(&params);
        let local = self.inner.host.local_settings(&params);
        let outcome = self.inner.engine.decide(&parent, &headers, &local);

        if let Some(response) = outcome.response {
            self.inner.host.set_response_headers(response, &params);
        }

        SamplingResult {
            decision: match outcome.decision {
                Decision::NotRecord => SamplingDecision::Drop,
                Decision::Record => SamplingDecision::RecordOnly,
                Decision::RecordAndSampled => SamplingDecision::RecordAndSample,
            },
            attributes: outcome.attributes,
            trace_state: match parent_context {
                Some(cx) => cx.span().span_context().trace_state().clone(),
                None => TraceState::default(),
            },
        }
    }
}

/// Builder for [`RemoteSampler`].
#[derive(Debug, Default)]
pub struct RemoteSamplerBuilder {
    host: Option<Box<dyn SamplerHost>>,
    metrics: Option<Arc<dyn SamplingMetrics>>,
    store: Option<Arc<SettingsStore>>,
}

impl RemoteSamplerBuilder {
    /// Use a custom host for local settings and headers.
    pub fn with_host<H: SamplerHost + 'static>(mut self, host: H) -> Self {
        self.host = Some(Box::new(host));
        self
    }

    /// Report sampling counters to the given sink.
    pub fn with_metrics<M: SamplingMetrics + 'static>(mut self, metrics: M) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    /// Report sampling counters to a shared sink.
    pub fn with_shared_metrics(mut self, metrics: Arc<dyn SamplingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Read settings from an existing store instead of creating one.
    pub fn with_store(mut self, store: Arc<SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> RemoteSampler {
        let host = self
            .host
            .unwrap_or_else(|| Box::new(ConfiguredHost::default()));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(OtelSamplingMetrics::default()));
        let store = self.store.unwrap_or_else(|| Arc::new(SettingsStore::new()));

        RemoteSampler {
            inner: Arc::new(SamplerInner {
                engine: DecisionEngine::new(store, metrics),
                host,
            }),
        }
    }
}
