use std::time::Duration;

use thiserror::Error;

use crate::options::CircuitBreakerTimeout;

/// The error type returned by loader functions.
///
/// Any `std::error::Error + Send + Sync` converts into it, as do `&str` and
/// `String`, so loaders can use `?` freely.
pub type LoaderError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when building a cache from its options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// The cache name is empty, or contains whitespace or control characters.
  #[error("cache name {0:?} must be non-blank and may not contain whitespace or control characters")]
  InvalidCacheName(String),

  /// `maximum_cache_size_indicator` was zero.
  #[error("maximum_cache_size_indicator cannot be less than 1")]
  ZeroMaximumSize,

  #[error("cache_item_expiry cannot be less than {min:?}, it is currently set to {actual:?}")]
  ExpiryTooShort { min: Duration, actual: Duration },

  #[error(
    "cache_item_expiry_jitter_percent must lie between 0 and 100, it is currently set to the unsupported value of {0}"
  )]
  JitterOutOfRange(u8),

  #[error("flush_interval cannot be less than {min:?}, it is currently set to {actual:?}")]
  FlushIntervalTooShort { min: Duration, actual: Duration },

  #[error("refresh_interval cannot be less than {min:?}, it is currently set to {actual:?}")]
  RefreshIntervalTooShort { min: Duration, actual: Duration },

  /// The refresh interval of a self-refreshing cache must leave the loader
  /// ample time to warm the next generation before entries expire.
  #[error(
    "refresh_interval ({refresh:?}) may be at most 50% of cache_item_expiry ({expiry:?}); decrease the refresh interval or increase the expiry"
  )]
  RefreshIntervalTooLong { refresh: Duration, expiry: Duration },

  /// A self-refreshing cache needs a loader known at construction time.
  #[error("a self-refreshing cache requires a loader")]
  LoaderRequired,

  /// The background maintenance thread could not be started.
  #[error("failed to spawn the {task} thread: {reason}")]
  Spawn { task: &'static str, reason: String },
}

/// Errors returned by cache read and load operations.
#[derive(Debug, Error)]
pub enum CacheError {
  /// Another caller is already loading this key and the wait for it exceeded
  /// the configured circuit breaker timeout. Retrying a little later may succeed.
  #[error(
    "the value for key {key} in cache '{cache}' is already being loaded and the circuit breaker timeout ({timeout}) was reached"
  )]
  CircuitBreakerTimeout {
    cache: String,
    key: String,
    timeout: CircuitBreakerTimeout,
  },

  /// The loader failed. The error is passed through untouched and nothing is cached.
  #[error("loader failed: {0}")]
  Loader(#[source] LoaderError),

  /// `get_or_load` was called without a per-call loader on a cache built without one.
  #[error("cache '{0}' has no loader configured")]
  NoLoader(String),

  /// Custom per-call loaders are rejected by the self-refreshing cache, which
  /// needs every generation loaded the same way.
  #[error("custom loaders are not supported by a self-refreshing cache")]
  NotSupported,

  /// A refresh cycle was aborted by a panic.
  #[error("refresh cycle panicked: {0}")]
  RefreshPanicked(String),
}

impl CacheError {
  /// Returns `true` if this is a circuit breaker timeout.
  pub fn is_circuit_breaker_timeout(&self) -> bool {
    matches!(self, CacheError::CircuitBreakerTimeout { .. })
  }
}
