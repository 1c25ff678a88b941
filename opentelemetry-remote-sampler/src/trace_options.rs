//! # Trace options
//!
//! Codec for the `X-Trace-Options` request header, which carries trigger
//! trace requests and custom key/value pairs, and for the
//! `X-Trace-Options-Response` header reporting what was done with them.
//!
//! Requests may be signed with an HMAC-SHA1 of the raw header, sent in the
//! `X-Trace-Options-Signature` header and validated with
//! [`validate_signature`].
use hmac::{Hmac, Mac};
use opentelemetry::otel_debug;
use regex::Regex;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Request header carrying the trace options.
pub const TRACE_OPTIONS_HEADER: &str = "X-Trace-Options";
/// Request header carrying the trace options signature.
pub const TRACE_OPTIONS_SIGNATURE_HEADER: &str = "X-Trace-Options-Signature";
/// Response header reporting the outcome of the trace options.
pub const TRACE_OPTIONS_RESPONSE_HEADER: &str = "X-Trace-Options-Response";

/// Maximum distance in seconds between a signed request timestamp and now.
pub const SIGNATURE_WINDOW_SECONDS: f64 = 5.0 * 60.0;

const TRIGGER_TRACE_KEY: &str = "trigger-trace";
const TIMESTAMP_KEY: &str = "ts";
const SW_KEYS_KEY: &str = "sw-keys";

static CUSTOM_KEY_REGEX: OnceLock<Regex> = OnceLock::new();

fn is_custom_key(key: &str) -> bool {
    CUSTOM_KEY_REGEX
        .get_or_init(|| Regex::new(r"^custom-[^\s]+$").expect("valid regex"))
        .is_match(key)
}

/// Parsed `X-Trace-Options` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceOptions {
    /// A trigger trace was requested.
    pub trigger_trace: bool,
    /// Request timestamp in unix seconds, used for signature validation.
    pub timestamp: Option<i64>,
    /// Opaque keys recorded as the `SWKeys` span attribute.
    pub sw_keys: Option<String>,
    /// `custom-*` keys and their values, recorded as span attributes.
    pub custom: BTreeMap<String, String>,
    /// Invalid or unrecognized options, in header order.
    pub ignored: Vec<(String, Option<String>)>,
}

/// Outcome of the request signature validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Auth {
    Ok,
    BadTimestamp,
    BadSignature,
    NoSignatureKey,
}

impl Auth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Auth::Ok => "ok",
            Auth::BadTimestamp => "bad-timestamp",
            Auth::BadSignature => "bad-signature",
            Auth::NoSignatureKey => "no-signature-key",
        }
    }
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a trigger trace request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerTrace {
    Ok,
    NotRequested,
    Ignored,
    TracingDisabled,
    TriggerTracingDisabled,
    RateExceeded,
    SettingsNotAvailable,
}

impl TriggerTrace {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerTrace::Ok => "ok",
            TriggerTrace::NotRequested => "not-requested",
            TriggerTrace::Ignored => "ignored",
            TriggerTrace::TracingDisabled => "tracing-disabled",
            TriggerTrace::TriggerTracingDisabled => "trigger-tracing-disabled",
            TriggerTrace::RateExceeded => "rate-exceeded",
            TriggerTrace::SettingsNotAvailable => "settings-not-available",
        }
    }
}

impl fmt::Display for TriggerTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated outcome of the trace options, serialized into the response header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceOptionsResponse {
    pub auth: Option<Auth>,
    pub trigger_trace: Option<TriggerTrace>,
    /// Keys of the ignored options, omitted from the response when empty.
    pub ignored: Vec<String>,
}

/// Trace options related request headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    /// Raw `X-Trace-Options` header value.
    pub trace_options: Option<String>,
    /// Raw `X-Trace-Options-Signature` header value.
    pub trace_options_signature: Option<String>,
}

/// Trace options related response headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    /// Serialized `X-Trace-Options-Response` header value.
    pub trace_options_response: Option<String>,
}

/// Parse an `X-Trace-Options` header.
///
/// Options are separated by `;` and split into a key and an optional value on
/// the first `=`. Invalid, duplicated and unrecognized options are collected
/// in [`TraceOptions::ignored`] without failing the parse.
pub fn parse_trace_options(header: &str) -> TraceOptions {
    let mut options = TraceOptions::default();

    let kvs = header
        .split(';')
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (kv.trim(), None),
        })
        .filter(|(k, _)| !k.is_empty());

    for (k, v) in kvs {
        let accepted = match k {
            TRIGGER_TRACE_KEY => {
                if v.is_none() && !options.trigger_trace {
                    options.trigger_trace = true;
                    true
                } else {
                    false
                }
            }
            TIMESTAMP_KEY => match v.map(str::parse::<i64>) {
                Some(Ok(ts)) if options.timestamp.is_none() => {
                    options.timestamp = Some(ts);
                    true
                }
                _ => false,
            },
            SW_KEYS_KEY => match v {
                Some(v) if options.sw_keys.is_none() => {
                    options.sw_keys = Some(v.to_string());
                    true
                }
                _ => false,
            },
            _ if is_custom_key(k) => match v {
                Some(v) if !options.custom.contains_key(k) => {
                    options.custom.insert(k.to_string(), v.to_string());
                    true
                }
                _ => false,
            },
            _ => false,
        };

        if !accepted {
            otel_debug!(name: "TraceOptions.OptionIgnored", key = k);
            options
                .ignored
                .push((k.to_string(), v.map(ToString::to_string)));
        }
    }

    options
}

/// Serialize a trace options response.
///
/// Present fields are written as `key=value` pairs joined by `;`, always in
/// the `auth`, `trigger-trace`, `ignored` order.
pub fn stringify_trace_options_response(response: &TraceOptionsResponse) -> String {
    let mut kvs = Vec::with_capacity(3);
    if let Some(auth) = response.auth {
        kvs.push(format!("auth={}", auth));
    }
    if let Some(trigger_trace) = response.trigger_trace {
        kvs.push(format!("trigger-trace={}", trigger_trace));
    }
    if !response.ignored.is_empty() {
        kvs.push(format!("ignored={}", response.ignored.join(",")));
    }
    kvs.join(";")
}

/// Validate the signature of a raw `X-Trace-Options` header.
///
/// The key is checked first, then the timestamp window, then the lowercase
/// hex HMAC-SHA1 of the header.
pub fn validate_signature(
    header: &str,
    signature: &str,
    key: Option<&[u8]>,
    timestamp: Option<i64>,
) -> Auth {
    validate_signature_at(
        header,
        signature,
        key,
        timestamp,
        opentelemetry::time::now(),
    )
}

pub(crate) fn validate_signature_at(
    header: &str,
    signature: &str,
    key: Option<&[u8]>,
    timestamp: Option<i64>,
    now: SystemTime,
) -> Auth {
    let Some(key) = key else {
        return Auth::NoSignatureKey;
    };

    let now = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    match timestamp {
        Some(ts) if (now - ts as f64).abs() <= SIGNATURE_WINDOW_SECONDS => {}
        _ => return Auth::BadTimestamp,
    }

    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(key) else {
        return Auth::BadSignature;
    };
    mac.update(header.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());

    if signature == digest {
        Auth::Ok
    } else {
        Auth::BadSignature
    }
}
