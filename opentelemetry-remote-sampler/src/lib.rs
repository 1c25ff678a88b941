//! # OpenTelemetry Remote Sampler
//!
//! A [`ShouldSample`](opentelemetry_sdk::trace::ShouldSample) implementation
//! whose behavior is driven by remotely distributed settings.
//!
//! The sampler combines:
//!
//! * probabilistic sampling at a remotely configured rate, rate limited by
//!   a [`TokenBucket`]
//! * trigger trace requests carried by the `X-Trace-Options` request header,
//!   optionally authenticated with an HMAC-SHA1 signature
//! * trust of upstream sampling decisions propagated in the `sw` trace state
//!   entry
//!
//! Settings are pushed to the sampler's [`SettingsStore`], usually by a
//! [`FileSettingsRefresher`]. Until settings are available no span is
//! recorded.
//!
//! Decisions reach downstream services through the `sw` entry that
//! [`SwTraceContextPropagator`] writes to the outgoing `tracestate`.
//!
//! ```no_run
//! use opentelemetry::global;
//! use opentelemetry::propagation::TextMapCompositePropagator;
//! use opentelemetry_remote_sampler::{
//!     default_settings_path, FileSettingsRefresher, RemoteSampler, RequestHeadersPropagator,
//!     SwTraceContextPropagator,
//! };
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! let sampler = RemoteSampler::builder().build();
//! let refresher = FileSettingsRefresher::spawn(default_settings_path(), sampler.store().clone())
//!     .expect("refresher thread");
//!
//! global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
//!     Box::new(SwTraceContextPropagator::new()),
//!     Box::new(RequestHeadersPropagator::new()),
//! ]));
//! let provider = SdkTracerProvider::builder().with_sampler(sampler).build();
//! global::set_tracer_provider(provider);
//!
//! // ...
//!
//! refresher.shutdown();
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod config;
pub mod dice;
pub mod engine;
pub mod error;
pub mod host;
pub mod metrics;
pub mod propagation;
pub mod refresher;
pub mod sampler;
pub mod settings;
pub mod store;
pub mod token_bucket;
pub mod trace_options;

pub use config::{SamplerConfig, TransactionSetting};
pub use dice::Dice;
pub use engine::{Decision, DecisionEngine, ParentSpan, SampleOutcome, SpanType};
pub use error::{SamplerError, SettingsError};
pub use host::{ConfiguredHost, HeaderStorage, SampleParams, SamplerHost};
pub use metrics::{NoopSamplingMetrics, OtelSamplingMetrics, SamplingCounter, SamplingMetrics};
pub use propagation::{
    sw_value, RequestHeadersPropagator, ResponseHeadersPropagator, SwTraceContextPropagator,
};
pub use refresher::{
    default_settings_path, load_settings_file, parse_settings, read_settings_file,
    FileSettingsRefresher,
};
pub use sampler::{RemoteSampler, RemoteSamplerBuilder};
pub use settings::{
    merge, BucketSettings, BucketType, Flags, LocalSettings, SampleSource, Settings, TracingMode,
    SAMPLE_RATE_SCALE,
};
pub use store::SettingsStore;
pub use token_bucket::{TokenBucket, TokenBucketSettings};
pub use trace_options::{
    parse_trace_options, stringify_trace_options_response, validate_signature, Auth,
    RequestHeaders, ResponseHeaders, TraceOptions, TraceOptionsResponse, TriggerTrace,
};
