#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes a shared counter store implementing fixed windows with expiry.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection pools already do so internally; there is no
/// need to wrap it twice.
///
/// All operations on one key must be atomic with respect to each other, the checker may be
/// invoked concurrently from many threads or processes.
pub trait Backend: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Count an attempt against the window for `input.key`.
    ///
    /// Starts a fresh window when none exists or the current one has elapsed. The attempt is
    /// only counted when it is allowed, so denied retries never grow the counter past
    /// `max_requests`.
    fn request(
        &self,
        input: WindowInput,
    ) -> impl Future<Output = Result<(Decision, WindowStatus), Self::Error>> + Send;

    /// Un-count a previously allowed attempt; the count never drops below zero.
    ///
    /// Nothing happens unless `window` is still the live window for the key, an attempt counted
    /// in an elapsed window must not free a slot in its successor.
    ///
    /// Note that if this function fails there is not much the caller can do about it, given that
    /// the action has already been allowed.
    fn rollback(
        &self,
        key: &str,
        window: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Status of the active window for a key without counting an attempt.
    ///
    /// Returns [None] if there is no active window.
    fn peek(
        &self,
        key: &str,
        max_requests: u64,
    ) -> impl Future<Output = Result<Option<WindowStatus>, Self::Error>> + Send;

    /// Removes the window for a given key.
    ///
    /// Intended to be used to reset a key before changing the interval.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Input for a single [Backend::request()].
#[derive(Debug, Clone)]
pub struct WindowInput {
    /// The rate limiting interval.
    pub interval: Duration,
    /// The total attempts to be allowed within the interval.
    pub max_requests: u64,
    /// The counter key, unique per actor and action.
    pub key: String,
}

/// The state of a window after a [Backend] operation.
#[derive(Debug, Clone)]
pub struct WindowStatus {
    /// Total number of attempts that are permitted within the interval.
    pub limit: u64,
    /// Number of attempts that will be permitted until the window resets.
    pub remaining: u64,
    /// Time at which the window resets.
    pub reset: Instant,
    /// Identifies the window, a new value is issued whenever a window starts for the key.
    pub window: u64,
}

impl WindowStatus {
    /// Seconds until the window resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    ///
    /// Used for the `x-ratelimit-reset` and `retry-after` headers.
    pub fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}
