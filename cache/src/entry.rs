use crate::time;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;

/// A value stored in the cache together with its timestamps.
///
/// Entries are handed to [`CacheListener`](crate::CacheListener) callbacks.
/// The value itself is never mutated; reloading a key replaces the whole entry.
pub struct CacheEntry<V> {
  value: Arc<V>,
  /// Nanoseconds since the cache epoch when the value was loaded (or when its
  /// expiry was last reset).
  loaded_at: AtomicU64,
  /// Nanoseconds since the cache epoch of the last successful read.
  last_accessed: AtomicU64,
  /// The effective time-to-live in nanoseconds, jitter included.
  ttl: u64,
  client_context: RwLock<Option<String>>,
}

impl<V> CacheEntry<V> {
  /// Creates a new entry loaded now.
  pub(crate) fn new(value: Arc<V>, ttl: Duration) -> Self {
    let now = time::now_nanos();
    Self {
      value,
      loaded_at: AtomicU64::new(now),
      last_accessed: AtomicU64::new(now),
      ttl: ttl.as_nanos().min(u64::MAX as u128) as u64,
      client_context: RwLock::new(None),
    }
  }

  /// The cached value.
  #[inline]
  pub fn value(&self) -> &Arc<V> {
    &self.value
  }

  /// When the value was loaded, or when its expiry was last reset.
  pub fn loaded_at(&self) -> Instant {
    time::nanos_to_instant(self.loaded_nanos())
  }

  /// When the value was last read.
  pub fn last_accessed(&self) -> Instant {
    time::nanos_to_instant(self.accessed_nanos())
  }

  /// The time-to-live this entry was given when it was written.
  pub fn time_to_live(&self) -> Duration {
    Duration::from_nanos(self.ttl)
  }

  /// An arbitrary tag owned by the client of the cache.
  pub fn client_context(&self) -> Option<String> {
    self.client_context.read().clone()
  }

  pub fn set_client_context(&self, context: impl Into<String>) {
    *self.client_context.write() = Some(context.into());
  }

  #[inline]
  pub(crate) fn loaded_nanos(&self) -> u64 {
    self.loaded_at.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn accessed_nanos(&self) -> u64 {
    self.last_accessed.load(Ordering::Relaxed)
  }

  /// Records a read.
  #[inline]
  pub(crate) fn touch(&self) {
    self
      .last_accessed
      .store(time::now_nanos(), Ordering::Relaxed);
  }

  /// Restarts the expiry clock, keeping the sampled time-to-live.
  #[inline]
  pub(crate) fn reset_expiry(&self) {
    self.loaded_at.store(time::now_nanos(), Ordering::Relaxed);
  }

  /// Whether the entry had outlived its time-to-live at `now_nanos`.
  #[inline]
  pub(crate) fn is_stale_at(&self, now_nanos: u64) -> bool {
    now_nanos.saturating_sub(self.loaded_nanos()) > self.ttl
  }

  #[inline]
  pub(crate) fn is_stale(&self) -> bool {
    self.is_stale_at(time::now_nanos())
  }
}

impl<V> fmt::Debug for CacheEntry<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("loaded_at", &self.loaded_nanos())
      .field("last_accessed", &self.accessed_nanos())
      .field("ttl", &self.time_to_live())
      .field("client_context", &*self.client_context.read())
      .finish_non_exhaustive()
  }
}

/// Draws an effective time-to-live around `expiry`.
///
/// The result is `expiry - window/2 + uniform(0, window)` where
/// `window = expiry * percent / 100`. A percent of zero returns `expiry`.
pub(crate) fn jittered_ttl<R: Rng + ?Sized>(expiry: Duration, percent: u8, rng: &mut R) -> Duration {
  let percent = percent.min(100) as u128;
  if percent == 0 {
    return expiry;
  }

  let base = expiry.as_nanos();
  let window = base * percent / 100;
  if window == 0 {
    return expiry;
  }
  let offset = rng.random_range(0..=window);
  let nanos = base - window / 2 + offset;
  Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}
