//! Storage of the current sampling settings.
//!
//! The [`SettingsStore`] keeps the latest remote settings and the token
//! buckets they configure. Expired settings are dropped on read.
use crate::settings::{merge, BucketType, LocalSettings, Settings};
use crate::token_bucket::{TokenBucket, TokenBucketSettings};
use opentelemetry::otel_debug;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

/// Refill interval of the rate limiting buckets, in milliseconds.
pub const BUCKET_INTERVAL: u64 = 1000;

/// Holds the latest sampling settings and the token buckets they configure.
///
/// Settings are replaced wholesale by the refresher and read by every
/// sampling decision. Readers see either the previous or the new settings.
#[derive(Debug)]
pub struct SettingsStore {
    settings: RwLock<Option<Settings>>,
    buckets: HashMap<BucketType, TokenBucket>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        SettingsStore::new()
    }
}

impl SettingsStore {
    /// Create an empty store. Its buckets start empty and are refilled every
    /// [`BUCKET_INTERVAL`] milliseconds once configured.
    pub fn new() -> Self {
        let buckets = BucketType::ALL
            .into_iter()
            .map(|bucket_type| {
                let bucket = TokenBucket::new(TokenBucketSettings {
                    interval: Some(BUCKET_INTERVAL),
                    ..Default::default()
                });
                bucket.start();
                (bucket_type, bucket)
            })
            .collect();

        SettingsStore {
            settings: RwLock::new(None),
            buckets,
        }
    }

    /// Store new settings if they are strictly newer than the current ones.
    ///
    /// On replacement the capacity and rate of every bucket present in the
    /// settings is pushed to the matching token bucket. Returns whether the
    /// settings were stored.
    pub fn update(&self, settings: Settings) -> bool {
        let mut current = self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(stored) = current.as_ref() {
            if settings.timestamp <= stored.timestamp {
                otel_debug!(
                    name: "SettingsStore.StaleSettingsIgnored",
                    timestamp = settings.timestamp,
                    current_timestamp = stored.timestamp
                );
                return false;
            }
        }

        for (bucket_type, bucket) in &self.buckets {
            if let Some(bucket_settings) = settings.buckets.get(bucket_type) {
                bucket.update(TokenBucketSettings {
                    capacity: Some(bucket_settings.capacity),
                    rate: Some(bucket_settings.rate),
                    interval: None,
                });
            }
        }

        otel_debug!(
            name: "SettingsStore.SettingsUpdated",
            timestamp = settings.timestamp,
            ttl = settings.ttl,
            sample_rate = settings.sample_rate,
            flags = format!("{:#x}", settings.flags)
        );
        *current = Some(settings);
        true
    }

    /// The stored settings merged with `local`, or `None` if no unexpired
    /// settings are available.
    pub fn current(&self, local: &LocalSettings) -> Option<Settings> {
        self.current_at(local, opentelemetry::time::now())
    }

    pub(crate) fn current_at(&self, local: &LocalSettings, now: SystemTime) -> Option<Settings> {
        {
            let current = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            match current.as_ref() {
                None => return None,
                Some(settings) if !settings.is_expired_at(now) => {
                    return Some(merge(settings, local));
                }
                Some(_) => {}
            }
        }

        let mut current = self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // another reader may have cleared or a writer replaced the settings in between
        match current.as_ref() {
            Some(settings) if settings.is_expired_at(now) => {
                otel_debug!(
                    name: "SettingsStore.SettingsExpired",
                    timestamp = settings.timestamp,
                    ttl = settings.ttl
                );
                *current = None;
                None
            }
            Some(settings) => Some(merge(settings, local)),
            None => None,
        }
    }

    /// The token bucket rate limiting the given class of traces.
    pub fn bucket(&self, bucket_type: BucketType) -> Option<&TokenBucket> {
        self.buckets.get(&bucket_type)
    }
}
