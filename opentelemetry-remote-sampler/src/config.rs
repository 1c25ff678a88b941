//! Local sampler configuration, read from the environment and overridable
//! with builder methods.
use crate::error::SamplerError;
use crate::settings::{LocalSettings, TracingMode};
use opentelemetry::otel_warn;
use regex::Regex;
use std::env;
use std::fmt;

/// Forces tracing on (`enabled`) or off (`disabled`) for the whole service.
pub(crate) const SW_APM_TRACING_MODE: &str = "SW_APM_TRACING_MODE";
/// Whether trigger trace requests are honored, `true` or `false`.
pub(crate) const SW_APM_TRIGGER_TRACE_ENABLED: &str = "SW_APM_TRIGGER_TRACE_ENABLED";
/// Default for [`SamplerConfig::trigger_trace_enabled`].
pub(crate) const SW_APM_TRIGGER_TRACE_ENABLED_DEFAULT: bool = true;

/// Tracing mode override for transactions whose identifier matches a pattern.
#[derive(Clone, Debug)]
pub struct TransactionSetting {
    tracing: bool,
    matcher: Regex,
}

impl TransactionSetting {
    /// Enable or disable tracing for transactions matching `pattern`.
    pub fn new(tracing: bool, pattern: &str) -> Result<Self, SamplerError> {
        let matcher = Regex::new(pattern)
            .map_err(|err| SamplerError::Config(format!("invalid transaction pattern: {}", err)))?;
        Ok(TransactionSetting { tracing, matcher })
    }

    /// Whether tracing is enabled for matching transactions.
    pub fn tracing(&self) -> bool {
        self.tracing
    }

    /// Whether the transaction identifier matches this setting.
    pub fn matches(&self, identifier: &str) -> bool {
        self.matcher.is_match(identifier)
    }
}

/// Local sampler configuration.
#[derive(Clone)]
pub struct SamplerConfig {
    pub(crate) tracing_mode: Option<TracingMode>,
    pub(crate) trigger_trace_enabled: bool,
    pub(crate) transaction_settings: Vec<TransactionSetting>,
}

impl fmt::Debug for SamplerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerConfig")
            .field("tracing_mode", &self.tracing_mode)
            .field("trigger_trace_enabled", &self.trigger_trace_enabled)
            .field("transaction_settings", &self.transaction_settings.len())
            .finish()
    }
}

impl Default for SamplerConfig {
    /// The configuration read from the environment.
    ///
    /// The supported environment variables are:
    /// * `SW_APM_TRACING_MODE`
    /// * `SW_APM_TRIGGER_TRACE_ENABLED`
    fn default() -> Self {
        SamplerConfig {
            tracing_mode: None,
            trigger_trace_enabled: SW_APM_TRIGGER_TRACE_ENABLED_DEFAULT,
            transaction_settings: Vec::new(),
        }
        .init_from_env_vars()
    }
}

impl SamplerConfig {
    /// Force tracing on or off, `None` defers to the remote settings.
    pub fn with_tracing_mode(mut self, tracing_mode: Option<TracingMode>) -> Self {
        self.tracing_mode = tracing_mode;
        self
    }

    /// Enable or disable trigger trace requests. Enabled by default.
    pub fn with_trigger_trace_enabled(mut self, enabled: bool) -> Self {
        self.trigger_trace_enabled = enabled;
        self
    }

    /// Add a per transaction tracing mode. The first matching setting wins.
    pub fn with_transaction_setting(mut self, setting: TransactionSetting) -> Self {
        self.transaction_settings.push(setting);
        self
    }

    pub fn tracing_mode(&self) -> Option<TracingMode> {
        self.tracing_mode
    }

    pub fn trigger_trace_enabled(&self) -> bool {
        self.trigger_trace_enabled
    }

    /// Local settings for the transaction with the given identifier.
    ///
    /// The tracing mode of the first matching transaction setting takes
    /// precedence over the configured tracing mode.
    pub fn local_settings(&self, identifier: &str) -> LocalSettings {
        let tracing_mode = self
            .transaction_settings
            .iter()
            .find(|setting| setting.matches(identifier))
            .map(|setting| {
                if setting.tracing {
                    TracingMode::Always
                } else {
                    TracingMode::Never
                }
            })
            .or(self.tracing_mode);

        LocalSettings {
            sample_rate: None,
            tracing_mode,
            trigger_mode: self.trigger_trace_enabled,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Ok(tracing_mode) = env::var(SW_APM_TRACING_MODE) {
            match tracing_mode.trim().to_ascii_lowercase().as_str() {
                "enabled" => self.tracing_mode = Some(TracingMode::Always),
                "disabled" => self.tracing_mode = Some(TracingMode::Never),
                _ => {
                    otel_warn!(
                        name: "SamplerConfig.InvalidTracingMode",
                        value = tracing_mode.as_str(),
                        message = "expected enabled or disabled, ignoring"
                    );
                }
            }
        }

        if let Ok(enabled) = env::var(SW_APM_TRIGGER_TRACE_ENABLED) {
            match enabled.trim().to_ascii_lowercase().as_str() {
                "true" => self.trigger_trace_enabled = true,
                "false" => self.trigger_trace_enabled = false,
                _ => {
                    otel_warn!(
                        name: "SamplerConfig.InvalidTriggerTraceEnabled",
                        value = enabled.as_str(),
                        message = "expected true or false, ignoring"
                    );
                }
            }
        }

        self
    }
}
