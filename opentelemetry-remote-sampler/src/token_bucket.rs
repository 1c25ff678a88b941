//! A self-replenishing token bucket.
//!
//! Tokens are added by a dedicated refill thread and consumed by sampling
//! decisions. Both go through a single mutex so every refill tick and every
//! [`TokenBucket::consume`] call is applied exactly once.
use opentelemetry::{otel_debug, otel_warn};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest accepted refill interval in milliseconds, the maximum of a signed 32 bit integer.
pub const MAX_INTERVAL: u64 = i32::MAX as u64;

/// Partial token bucket settings, unset fields are left unchanged on update.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TokenBucketSettings {
    /// Maximum number of stored tokens.
    pub capacity: Option<f64>,
    /// Number of tokens added every interval.
    pub rate: Option<f64>,
    /// Refill interval in milliseconds.
    pub interval: Option<u64>,
}

struct BucketState {
    capacity: f64,
    rate: f64,
    interval: u64,
    tokens: f64,
}

impl BucketState {
    fn set_capacity(&mut self, capacity: f64) {
        self.capacity = capacity.max(0.0);
    }

    fn set_rate(&mut self, rate: f64) {
        self.rate = rate.max(0.0);
    }

    fn set_interval(&mut self, interval: u64) {
        self.interval = interval.min(MAX_INTERVAL);
    }

    fn set_tokens(&mut self, tokens: f64) {
        self.tokens = tokens.min(self.capacity).max(0.0);
        debug_assert!(
            self.tokens >= 0.0 && self.tokens <= self.capacity,
            "token count out of bounds"
        );
    }

    fn refill(&mut self) {
        self.set_tokens(self.tokens + self.rate);
    }
}

enum BucketMessage {
    Shutdown,
}

struct RefillThread {
    sender: SyncSender<BucketMessage>,
    handle: JoinHandle<()>,
}

/// A token bucket replenished in the background.
///
/// The bucket starts full. Call [`TokenBucket::start`] to begin adding `rate`
/// tokens every `interval` milliseconds. The refill thread never keeps the
/// process alive and is stopped when the bucket is dropped.
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
    refill: Mutex<Option<RefillThread>>,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("TokenBucket")
            .field("capacity", &state.capacity)
            .field("rate", &state.rate)
            .field("interval", &state.interval)
            .field("tokens", &state.tokens)
            .finish()
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        TokenBucket::new(TokenBucketSettings::default())
    }
}

impl TokenBucket {
    /// Create a new, stopped, full bucket.
    ///
    /// Missing capacity and rate default to zero, a missing interval to [`MAX_INTERVAL`].
    pub fn new(settings: TokenBucketSettings) -> Self {
        let mut state = BucketState {
            capacity: 0.0,
            rate: 0.0,
            interval: MAX_INTERVAL,
            tokens: 0.0,
        };
        state.set_capacity(settings.capacity.unwrap_or(0.0));
        state.set_rate(settings.rate.unwrap_or(0.0));
        state.set_interval(settings.interval.unwrap_or(MAX_INTERVAL));
        state.set_tokens(state.capacity);

        TokenBucket {
            state: Arc::new(Mutex::new(state)),
            refill: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of stored tokens.
    pub fn capacity(&self) -> f64 {
        self.state().capacity
    }

    /// Number of tokens added every interval.
    pub fn rate(&self) -> f64 {
        self.state().rate
    }

    /// Refill interval in milliseconds.
    pub fn interval(&self) -> u64 {
        self.state().interval
    }

    /// Number of tokens currently available.
    pub fn tokens(&self) -> f64 {
        self.state().tokens
    }

    /// Update the bucket settings.
    ///
    /// A capacity change is applied to the current token count as well, so
    /// growing the bucket grants the difference immediately. Changing the
    /// interval of a running bucket restarts its refill thread.
    pub fn update(&self, settings: TokenBucketSettings) {
        let restart = {
            let mut state = self.state();
            if let Some(capacity) = settings.capacity {
                let difference = capacity - state.capacity;
                state.set_capacity(capacity);
                let tokens = state.tokens + difference;
                state.set_tokens(tokens);
            }
            if let Some(rate) = settings.rate {
                state.set_rate(rate);
            }
            match settings.interval {
                Some(interval) => {
                    let previous = state.interval;
                    state.set_interval(interval);
                    previous != state.interval
                }
                None => false,
            }
        };

        if restart && self.running() {
            self.stop();
            self.start();
        }
    }

    /// Attempt to take `n` tokens out of the bucket.
    ///
    /// Either all `n` tokens are taken and `true` is returned, or the bucket
    /// is left untouched and `false` is returned.
    pub fn consume(&self, n: f64) -> bool {
        let mut state = self.state();
        if state.tokens >= n {
            let tokens = state.tokens - n;
            state.set_tokens(tokens);
            true
        } else {
            false
        }
    }

    /// Start replenishing the bucket. Does nothing if already running.
    pub fn start(&self) {
        let mut refill = self.refill.lock().unwrap_or_else(PoisonError::into_inner);
        if refill.is_some() {
            return;
        }

        let interval = self.interval();
        let period = Duration::from_millis(interval.max(1));
        let state = Arc::clone(&self.state);
        let (sender, receiver) = mpsc::sync_channel::<BucketMessage>(1);

        let spawned = thread::Builder::new()
            .name("TokenBucketRefillThread".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .refill();
                    }
                    Ok(BucketMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => {
                otel_debug!(name: "TokenBucket.RefillStarted", interval_ms = interval);
                *refill = Some(RefillThread { sender, handle });
            }
            Err(err) => {
                otel_warn!(
                    name: "TokenBucket.RefillThreadSpawnFailed",
                    reason = format!("{}", err)
                );
            }
        }
    }

    /// Stop replenishing the bucket. Does nothing if not running.
    pub fn stop(&self) {
        let refill = self
            .refill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(RefillThread { sender, handle }) = refill {
            // the thread also exits on disconnect, a failed send is fine
            let _ = sender.send(BucketMessage::Shutdown);
            if handle.join().is_err() {
                otel_warn!(name: "TokenBucket.RefillThreadPanicked");
            }
            otel_debug!(name: "TokenBucket.RefillStopped");
        }
    }

    /// Whether the bucket is being replenished.
    pub fn running(&self) -> bool {
        self.refill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[cfg(test)]
    fn refill(&self) {
        self.state().refill();
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop();
    }
}
