//! Configuration for [`Cache`](crate::Cache) and
//! [`SelfRefreshingCache`](crate::SelfRefreshingCache).
//!
//! With the `serde` feature both option structs can be deserialized from any
//! serde format. Durations use the human readable `humantime` notation
//! (`"60s"`, `"2000ms"`, `"5m"`) and every field falls back to its default.

use crate::error::BuildError;

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAXIMUM_CACHE_SIZE_INDICATOR: usize = 10_000;
pub const DEFAULT_CACHE_ITEM_EXPIRY: Duration = Duration::from_secs(60);
pub const DEFAULT_EXPIRY_JITTER_PERCENT: u8 = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_CIRCUIT_BREAKER_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// The item expiry of a default self-refreshing cache. It must be at least
/// twice the refresh interval, so it differs from `DEFAULT_CACHE_ITEM_EXPIRY`.
pub const DEFAULT_SELF_REFRESHING_ITEM_EXPIRY: Duration = Duration::from_secs(10 * 60);

pub const MIN_CACHE_ITEM_EXPIRY: Duration = Duration::from_millis(10);
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(50);

/// How long a caller waits for a key that another caller is already loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CircuitBreakerTimeout {
  /// Fail immediately if the key is busy loading.
  FailFast,
  /// Wait up to the given duration, then fail.
  After(#[cfg_attr(feature = "serde", serde(with = "humantime_serde"))] Duration),
  /// Wait until the in-flight load completes, however long it takes.
  Forever,
}

impl CircuitBreakerTimeout {
  /// Maps a plain duration onto a timeout: zero fails fast, `Duration::MAX`
  /// waits forever, anything else is a bounded wait.
  pub fn from_duration(duration: Duration) -> Self {
    if duration.is_zero() {
      CircuitBreakerTimeout::FailFast
    } else if duration == Duration::MAX {
      CircuitBreakerTimeout::Forever
    } else {
      CircuitBreakerTimeout::After(duration)
    }
  }
}

impl Default for CircuitBreakerTimeout {
  fn default() -> Self {
    CircuitBreakerTimeout::After(DEFAULT_CIRCUIT_BREAKER_TIMEOUT)
  }
}

impl From<Duration> for CircuitBreakerTimeout {
  fn from(duration: Duration) -> Self {
    Self::from_duration(duration)
  }
}

impl fmt::Display for CircuitBreakerTimeout {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CircuitBreakerTimeout::FailFast => write!(f, "0 ms, fail fast"),
      CircuitBreakerTimeout::After(d) => write!(f, "{} ms", d.as_millis()),
      CircuitBreakerTimeout::Forever => write!(f, "infinite"),
    }
  }
}

/// Options for a [`Cache`](crate::Cache).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheOptions {
  /// Used in log fields and error messages.
  pub cache_name: String,

  /// The number of entries the flush pass trims the cache down to.
  ///
  /// This is a high-water mark, not a hard cap: between flush passes the
  /// cache may hold more entries than this.
  pub maximum_cache_size_indicator: usize,

  /// How long a loaded entry stays fresh.
  #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
  pub cache_item_expiry: Duration,

  /// Symmetric random spread applied to `cache_item_expiry`, as a percentage.
  ///
  /// With expiry `T` and jitter `p`, each entry gets a time-to-live drawn
  /// uniformly from `[T - T*p/200, T + T*p/200]` when it is written. This keeps
  /// entries loaded together from all expiring together.
  pub cache_item_expiry_jitter_percent: u8,

  /// How often the background flush pass runs.
  #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
  pub flush_interval: Duration,

  pub circuit_breaker_timeout: CircuitBreakerTimeout,

  /// Run the configured disposer on values that are invalidated or evicted.
  pub dispose_expired_values: bool,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      cache_name: "default".to_string(),
      maximum_cache_size_indicator: DEFAULT_MAXIMUM_CACHE_SIZE_INDICATOR,
      cache_item_expiry: DEFAULT_CACHE_ITEM_EXPIRY,
      cache_item_expiry_jitter_percent: DEFAULT_EXPIRY_JITTER_PERCENT,
      flush_interval: DEFAULT_FLUSH_INTERVAL,
      circuit_breaker_timeout: CircuitBreakerTimeout::default(),
      dispose_expired_values: false,
    }
  }
}

impl CacheOptions {
  /// Creates default options with the given cache name.
  pub fn named(cache_name: impl Into<String>) -> Self {
    Self {
      cache_name: cache_name.into(),
      ..Self::default()
    }
  }

  /// Checks the numeric and naming invariants.
  pub fn validate(&self) -> Result<(), BuildError> {
    let name = &self.cache_name;
    if name.trim().is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
      return Err(BuildError::InvalidCacheName(name.clone()));
    }
    if self.maximum_cache_size_indicator < 1 {
      return Err(BuildError::ZeroMaximumSize);
    }
    if self.cache_item_expiry < MIN_CACHE_ITEM_EXPIRY {
      return Err(BuildError::ExpiryTooShort {
        min: MIN_CACHE_ITEM_EXPIRY,
        actual: self.cache_item_expiry,
      });
    }
    if self.cache_item_expiry_jitter_percent > 100 {
      return Err(BuildError::JitterOutOfRange(
        self.cache_item_expiry_jitter_percent,
      ));
    }
    if self.flush_interval < MIN_FLUSH_INTERVAL {
      return Err(BuildError::FlushIntervalTooShort {
        min: MIN_FLUSH_INTERVAL,
        actual: self.flush_interval,
      });
    }
    Ok(())
  }
}

/// Options for a [`SelfRefreshingCache`](crate::SelfRefreshingCache).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SelfRefreshingCacheOptions {
  /// Options of the underlying generation cache.
  pub cache: CacheOptions,

  /// How often the next generation is loaded and swapped in.
  ///
  /// Must be at most half of `cache.cache_item_expiry`.
  #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
  pub refresh_interval: Duration,
}

impl Default for SelfRefreshingCacheOptions {
  fn default() -> Self {
    Self {
      cache: CacheOptions {
        cache_item_expiry: DEFAULT_SELF_REFRESHING_ITEM_EXPIRY,
        ..CacheOptions::default()
      },
      refresh_interval: DEFAULT_REFRESH_INTERVAL,
    }
  }
}

impl SelfRefreshingCacheOptions {
  pub fn validate(&self) -> Result<(), BuildError> {
    self.cache.validate()?;
    if self.refresh_interval < MIN_REFRESH_INTERVAL {
      return Err(BuildError::RefreshIntervalTooShort {
        min: MIN_REFRESH_INTERVAL,
        actual: self.refresh_interval,
      });
    }
    // refresh <= expiry / 2, compared without losing precision.
    if self.refresh_interval.as_nanos() * 2 > self.cache.cache_item_expiry.as_nanos() {
      return Err(BuildError::RefreshIntervalTooLong {
        refresh: self.refresh_interval,
        expiry: self.cache.cache_item_expiry,
      });
    }
    Ok(())
  }
}
