//! # Sampling settings
//!
//! [`Settings`] are distributed by the collector and refreshed periodically.
//! They are combined with host supplied [`LocalSettings`] using [`merge`]
//! before every sampling decision.
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Scale of [`Settings::sample_rate`], the rate is expressed in parts per million.
pub const SAMPLE_RATE_SCALE: u32 = 1_000_000;

/// Sampling flags distributed alongside the remote settings.
///
/// The absence of a flag is its default, an empty set disables sampling entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    /// No flags set.
    pub const OK: Flags = Flags(0x0);
    /// The settings are invalid.
    pub const INVALID: Flags = Flags(0x1);
    /// Remote settings take precedence over local settings.
    pub const OVERRIDE: Flags = Flags(0x2);
    /// Traces may be started by this service.
    pub const SAMPLE_START: Flags = Flags(0x4);
    /// Sampling decisions of upstream services are trusted.
    pub const SAMPLE_THROUGH_ALWAYS: Flags = Flags(0x10);
    /// Trigger trace requests are honored.
    pub const TRIGGERED_TRACE: Flags = Flags(0x20);

    /// Construct flags from their raw representation
    pub const fn new(flags: u32) -> Self {
        Flags(flags)
    }

    /// Returns `true` if every flag in `other` is also set in `self`
    pub fn contains(&self, other: Flags) -> bool {
        (*self & other) == other
    }

    /// Returns the raw representation of the flags
    pub fn to_u32(self) -> u32 {
        self.0
    }
}

impl BitAnd for Flags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Flags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl Not for Flags {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl fmt::LowerHex for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Tracing mode configured locally by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingMode {
    /// Force tracing on.
    Always,
    /// Force tracing off.
    Never,
}

impl TracingMode {
    /// The flags controlled by a tracing mode.
    pub const MASK: Flags = Flags(Flags::SAMPLE_START.0 | Flags::SAMPLE_THROUGH_ALWAYS.0);

    /// The flags forced on by this tracing mode.
    pub fn flags(&self) -> Flags {
        match self {
            TracingMode::Always => Self::MASK,
            TracingMode::Never => Flags::OK,
        }
    }
}

/// Class of token bucket used to rate limit a kind of trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketType {
    /// Bucket limiting traces started from a dice roll.
    Default,
    /// Bucket limiting signed trigger trace requests.
    TriggerRelaxed,
    /// Bucket limiting unsigned trigger trace requests.
    TriggerStrict,
}

impl BucketType {
    /// All the bucket classes.
    pub const ALL: [BucketType; 3] = [
        BucketType::Default,
        BucketType::TriggerRelaxed,
        BucketType::TriggerStrict,
    ];
}

/// Capacity and replenish rate of a token bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BucketSettings {
    /// Maximum number of stored tokens.
    pub capacity: f64,
    /// Number of tokens added on every refill tick.
    pub rate: f64,
}

impl BucketSettings {
    /// Create new bucket settings.
    pub fn new(capacity: f64, rate: f64) -> Self {
        BucketSettings { capacity, rate }
    }
}

/// Provenance of the sample rate.
///
/// The numeric value is reported as is in the `SampleSource` span attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum SampleSource {
    /// Read from a local settings file.
    File = 1,
    /// Built-in default used while no settings are available.
    LocalDefault = 2,
    /// Distributed by the collector.
    Remote = 6,
    /// Provided programmatically by the host.
    Custom = 7,
}

impl SampleSource {
    /// The numeric code of the sample source.
    pub fn code(&self) -> i64 {
        *self as i64
    }
}

/// Sampling settings, usually distributed by the collector.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Sample rate in parts per million, see [`SAMPLE_RATE_SCALE`].
    pub sample_rate: u32,
    /// Where the sample rate comes from.
    pub sample_source: SampleSource,
    /// Sampling flags.
    pub flags: Flags,
    /// Token bucket settings per bucket class.
    pub buckets: HashMap<BucketType, BucketSettings>,
    /// Key used to validate trigger trace request signatures.
    pub signature_key: Option<Vec<u8>>,
    /// Unix timestamp of the settings, in seconds.
    pub timestamp: u64,
    /// Number of seconds after `timestamp` the settings remain valid.
    pub ttl: u64,
}

impl Settings {
    /// The instant after which the settings must no longer be used.
    pub fn expiry(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.timestamp.saturating_add(self.ttl))
    }

    /// Whether the settings have expired at the given time.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now > self.expiry()
    }
}

/// Settings computed by the host for a single sampling decision.
///
/// Unset fields fall back to the remote settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalSettings {
    /// Locally configured sample rate.
    pub sample_rate: Option<u32>,
    /// Locally configured tracing mode.
    pub tracing_mode: Option<TracingMode>,
    /// Whether trigger trace requests are enabled locally.
    pub trigger_mode: bool,
}

impl Default for LocalSettings {
    /// Trigger tracing is enabled unless the host disables it.
    fn default() -> Self {
        LocalSettings {
            sample_rate: None,
            tracing_mode: None,
            trigger_mode: true,
        }
    }
}

/// Merges remote and local settings.
///
/// When the remote settings carry [`Flags::OVERRIDE`] the local settings are
/// ignored and the remote settings are returned unchanged. Otherwise the lower
/// sample rate wins, the local tracing mode forces [`Flags::SAMPLE_START`] and
/// [`Flags::SAMPLE_THROUGH_ALWAYS`] on or off, and the local trigger mode forces
/// [`Flags::TRIGGERED_TRACE`] on or off.
pub fn merge(remote: &Settings, local: &LocalSettings) -> Settings {
    let mut merged = remote.clone();
    if remote.flags.contains(Flags::OVERRIDE) {
        return merged;
    }

    if let Some(sample_rate) = local.sample_rate {
        merged.sample_rate = sample_rate.min(remote.sample_rate);
    }

    if let Some(tracing_mode) = local.tracing_mode {
        merged.flags &= !TracingMode::MASK;
        merged.flags |= tracing_mode.flags();
    }

    if local.trigger_mode {
        merged.flags |= Flags::TRIGGERED_TRACE;
    } else {
        merged.flags &= !Flags::TRIGGERED_TRACE;
    }

    merged
}
