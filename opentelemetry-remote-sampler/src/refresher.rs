//! # Settings refresher
//!
//! Keeps a [`SettingsStore`] up to date from a JSON settings file written by
//! an external agent. The file holds either a settings object or an array
//! containing a single one:
//!
//! ```json
//! [{
//!   "flags": "SAMPLE_START,SAMPLE_THROUGH_ALWAYS,TRIGGER_TRACE",
//!   "value": 1000000,
//!   "timestamp": 1700000000,
//!   "ttl": 120,
//!   "arguments": {
//!     "BucketCapacity": 2,
//!     "BucketRate": 1,
//!     "TriggerRelaxedBucketCapacity": 20,
//!     "TriggerRelaxedBucketRate": 1,
//!     "TriggerStrictBucketCapacity": 6,
//!     "TriggerStrictBucketRate": 0.1,
//!     "SignatureKey": "key"
//!   }
//! }]
//! ```
use crate::error::{SamplerError, SettingsError};
use crate::settings::{
    BucketSettings, BucketType, Flags, SampleSource, Settings, SAMPLE_RATE_SCALE,
};
use crate::store::SettingsStore;
use opentelemetry::{otel_debug, otel_warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use std::{env, fs};

/// File name of the settings file in the temporary directory.
pub const SETTINGS_FILE_NAME: &str = "solarwinds-apm-settings.json";

/// How long before expiry the settings file is read again.
pub(crate) const REFRESH_BEFORE_EXPIRY: Duration = Duration::from_secs(10);
/// Delay between attempts when the file is missing or invalid.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default location of the settings file.
pub fn default_settings_path() -> PathBuf {
    env::temp_dir().join(SETTINGS_FILE_NAME)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SettingsDocument {
    List(Vec<RawSettings>),
    Single(RawSettings),
}

#[derive(Deserialize)]
struct RawSettings {
    flags: Option<String>,
    #[serde(default)]
    value: f64,
    timestamp: f64,
    ttl: f64,
    #[serde(default)]
    arguments: RawArguments,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawArguments {
    bucket_capacity: Option<f64>,
    bucket_rate: Option<f64>,
    trigger_relaxed_bucket_capacity: Option<f64>,
    trigger_relaxed_bucket_rate: Option<f64>,
    trigger_strict_bucket_capacity: Option<f64>,
    trigger_strict_bucket_rate: Option<f64>,
    signature_key: Option<String>,
}

fn parse_flags(flags: &str) -> Flags {
    flags
        .split(',')
        .fold(Flags::OK, |flags, name| match name.trim() {
            "OVERRIDE" => flags | Flags::OVERRIDE,
            "SAMPLE_START" => flags | Flags::SAMPLE_START,
            "SAMPLE_THROUGH_ALWAYS" => flags | Flags::SAMPLE_THROUGH_ALWAYS,
            "TRIGGER_TRACE" => flags | Flags::TRIGGERED_TRACE,
            _ => flags,
        })
}

/// Whole seconds from a JSON number.
fn seconds(value: f64, field: &str) -> Result<u64, SettingsError> {
    if !(0.0..=u64::MAX as f64).contains(&value) {
        return Err(SettingsError::Invalid(format!("{} is out of range: {}", field, value)));
    }
    Ok(value.trunc() as u64)
}

/// Parse a JSON settings document.
pub fn parse_settings(json: &str) -> Result<Settings, SettingsError> {
    let raw = match serde_json::from_str::<SettingsDocument>(json)? {
        SettingsDocument::Single(raw) => raw,
        SettingsDocument::List(mut list) => {
            if list.len() != 1 {
                return Err(SettingsError::Invalid(format!(
                    "expected exactly one settings entry, found {}",
                    list.len()
                )));
            }
            list.remove(0)
        }
    };

    if !raw.value.is_finite() {
        return Err(SettingsError::Invalid("sample rate is not a number".into()));
    }
    let sample_rate = raw.value.clamp(0.0, f64::from(SAMPLE_RATE_SCALE)).round() as u32;
    let timestamp = seconds(raw.timestamp, "timestamp")?;
    let ttl = seconds(raw.ttl, "ttl")?;

    let args = raw.arguments;
    let mut buckets = HashMap::new();
    for (bucket_type, capacity, rate) in [
        (BucketType::Default, args.bucket_capacity, args.bucket_rate),
        (
            BucketType::TriggerRelaxed,
            args.trigger_relaxed_bucket_capacity,
            args.trigger_relaxed_bucket_rate,
        ),
        (
            BucketType::TriggerStrict,
            args.trigger_strict_bucket_capacity,
            args.trigger_strict_bucket_rate,
        ),
    ] {
        if let (Some(capacity), Some(rate)) = (capacity, rate) {
            buckets.insert(bucket_type, BucketSettings::new(capacity, rate));
        }
    }

    Ok(Settings {
        sample_rate,
        sample_source: SampleSource::Remote,
        flags: raw.flags.as_deref().map(parse_flags).unwrap_or(Flags::OK),
        buckets,
        signature_key: args.signature_key.map(String::into_bytes),
        timestamp,
        ttl,
    })
}

/// Read and parse a JSON settings file.
pub fn read_settings_file(path: &Path) -> Result<Settings, SettingsError> {
    let contents = fs::read_to_string(path)?;
    parse_settings(&contents)
}

/// Read the settings file once and push it to `store`.
///
/// Returns whether the store accepted the settings, see [`SettingsStore::update`].
pub fn load_settings_file(path: &Path, store: &SettingsStore) -> Result<bool, SamplerError> {
    let settings = read_settings_file(path)?;
    Ok(store.update(settings))
}

/// Delay until the settings should be read again.
fn refresh_delay(expiry: SystemTime, now: SystemTime) -> Duration {
    expiry
        .checked_sub(REFRESH_BEFORE_EXPIRY)
        .and_then(|refresh_at| refresh_at.duration_since(now).ok())
        .unwrap_or_default()
        .max(RETRY_INTERVAL)
}

enum RefresherMessage {
    Shutdown,
}

/// Periodically reloads a settings file into a [`SettingsStore`].
///
/// The file is read on start, then again shortly before the loaded settings
/// expire. Missing or invalid files are retried every second.
#[derive(Debug)]
pub struct FileSettingsRefresher {
    path: PathBuf,
    sender: SyncSender<RefresherMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileSettingsRefresher {
    /// Start refreshing `store` from the file at `path` on a dedicated thread.
    pub fn spawn(
        path: impl Into<PathBuf>,
        store: Arc<SettingsStore>,
    ) -> Result<Self, SamplerError> {
        let path = path.into();
        let (sender, receiver) = mpsc::sync_channel::<RefresherMessage>(1);

        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("SettingsRefresherThread".to_string())
            .spawn(move || {
                let mut last_error: Option<String> = None;
                loop {
                    let delay = match read_settings_file(&thread_path) {
                        Ok(settings) => {
                            last_error = None;
                            let expiry = settings.expiry();
                            if store.update(settings) {
                                otel_debug!(
                                    name: "SettingsRefresher.SettingsLoaded",
                                    path = format!("{}", thread_path.display())
                                );
                            }
                            refresh_delay(expiry, opentelemetry::time::now())
                        }
                        Err(err) => {
                            let message = err.to_string();
                            if last_error.as_deref() != Some(message.as_str()) {
                                otel_warn!(
                                    name: "SettingsRefresher.LoadFailed",
                                    path = format!("{}", thread_path.display()),
                                    reason = message.as_str()
                                );
                                last_error = Some(message);
                            }
                            RETRY_INTERVAL
                        }
                    };

                    match receiver.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(RefresherMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            break
                        }
                    }
                }
                otel_debug!(name: "SettingsRefresher.Stopped");
            })
            .map_err(SamplerError::ThreadSpawn)?;

        Ok(FileSettingsRefresher {
            path,
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Path of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop refreshing and wait for the refresher thread to exit.
    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.sender.try_send(RefresherMessage::Shutdown);
            if handle.join().is_err() {
                otel_warn!(name: "SettingsRefresher.ThreadPanicked");
            }
        }
    }
}

impl Drop for FileSettingsRefresher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
