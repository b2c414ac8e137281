use crate::error::{CacheError, LoaderError};
#[cfg(feature = "tokio")]
use crate::handles::AsyncCache;
use crate::iter::Iter;
use crate::metrics::Metrics;
use crate::options::CacheOptions;
use crate::shared::CacheShared;
use crate::task::janitor::{self, FlushOutcome};
use crate::MetricsSnapshot;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

/// A thread-safe, synchronous cache in front of a loader.
///
/// Concurrent misses on the same key run the loader once: the first caller
/// takes the key's gate and loads, the others wait for it (bounded by the
/// circuit breaker timeout) and then read what it stored. A background
/// janitor thread drops stale entries and trims the cache back to its size
/// indicator on every flush interval.
///
/// Dropping the last handle shuts the cache down.
pub struct Cache<K, V> {
  pub(crate) shared: Arc<CacheShared<K, V>>,
}

impl<K, V> fmt::Debug for Cache<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache").field("shared", &self.shared).finish()
  }
}

impl<K, V> Cache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  /// Returns an async handle to the same cache. This is a zero-cost
  /// conversion.
  #[cfg(feature = "tokio")]
  pub fn to_async(&self) -> AsyncCache<K, V> {
    AsyncCache {
      shared: self.shared.clone(),
    }
  }

  /// Returns the value for `key` if a fresh entry is present.
  ///
  /// A stale entry is reported as absent but left in place for the flush pass.
  pub fn get(&self, key: &K) -> Option<Arc<V>> {
    self.get_with_reset(key, false)
  }

  /// Like [`get`](Self::get), and on a hit optionally restarts the entry's
  /// expiry clock.
  pub fn get_with_reset(&self, key: &K, reset_expiry: bool) -> Option<Arc<V>> {
    match self.shared.lookup(key, reset_expiry) {
      Some(entry) => Some(entry.value().clone()),
      None => {
        Metrics::incr(&self.shared.metrics.misses);
        None
      }
    }
  }

  /// Returns the value for `key`, running the cache's loader on a miss.
  pub fn get_or_load(&self, key: &K) -> Result<Arc<V>, CacheError> {
    self.get_or_load_with_reset(key, false)
  }

  pub fn get_or_load_with_reset(&self, key: &K, reset_expiry: bool) -> Result<Arc<V>, CacheError> {
    let loader = self
      .shared
      .loader
      .clone()
      .ok_or_else(|| self.shared.no_loader())?;
    self.load(key, reset_expiry, |key| loader(key))
  }

  /// Returns the value for `key`, running `loader` instead of the cache's
  /// loader on a miss.
  pub fn get_or_load_with<F, E>(&self, key: &K, loader: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Into<LoaderError>,
  {
    self.get_or_load_using(key, false, loader)
  }

  pub fn get_or_load_using<F, E>(
    &self,
    key: &K,
    reset_expiry: bool,
    loader: F,
  ) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Into<LoaderError>,
  {
    self.load(key, reset_expiry, |key| loader(key).map_err(Into::into))
  }

  /// The single-flight load protocol.
  fn load<F>(&self, key: &K, reset_expiry: bool, loader: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Result<V, LoaderError>,
  {
    if let Some(entry) = self.shared.lookup(key, reset_expiry) {
      return Ok(entry.value().clone());
    }

    let gate = self.shared.gates.gate_for(key);
    let Some(_permit) = gate.acquire(self.shared.options.circuit_breaker_timeout) else {
      return Err(self.shared.circuit_breaker_tripped(key));
    };

    // Whoever held the gate before us may have just stored it.
    if let Some(entry) = self.shared.lookup(key, reset_expiry) {
      return Ok(entry.value().clone());
    }

    Metrics::incr(&self.shared.metrics.misses);
    let started = Instant::now();
    let loaded = loader(key);
    self.shared.store_loaded(key, loaded, started.elapsed())
  }

  /// Stores `value` without loading. Returns `false`, leaving the cache
  /// untouched, if an entry for `key` is already present (fresh or stale).
  pub fn try_add(&self, key: K, value: V) -> bool {
    let entry = self.shared.new_entry(Arc::new(value));
    let added = self.shared.store.try_add(key, entry);
    if added {
      Metrics::incr(&self.shared.metrics.inserts);
    }
    added
  }

  /// Removes the entry for `key`, returning `true` if there was one.
  pub fn invalidate(&self, key: &K) -> bool {
    self.shared.invalidate(key)
  }

  /// Removes every entry, one key at a time.
  pub fn invalidate_all(&self) {
    self.shared.invalidate_all();
  }

  /// Whether the store holds an entry for `key`, fresh or stale.
  pub fn has_key(&self, key: &K) -> bool {
    self.shared.store.try_get(key).is_some()
  }

  /// Runs a flush pass now, waiting for a pass already in progress to finish first.
  pub fn flush_invalidated_entries(&self) -> FlushOutcome {
    janitor::flush_invalidated_entries(&self.shared)
  }

  /// The number of entries in the store, including stale entries the flush
  /// pass has not yet removed.
  pub fn count(&self) -> usize {
    self.shared.store.len()
  }

  /// Iterates over the entries in the store, fresh and stale.
  ///
  /// The iteration is not a point-in-time snapshot; it walks the store one
  /// shard at a time and may or may not see concurrent changes.
  pub fn items(&self) -> Iter<'_, K, V> {
    Iter::new(self.shared.store.iter())
  }

  pub fn name(&self) -> &str {
    self.shared.name()
  }

  pub fn options(&self) -> &CacheOptions {
    &self.shared.options
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  /// Stops the janitor, releases all key gates and invalidates every entry.
  ///
  /// Idempotent; also run when the cache is dropped.
  pub fn shutdown(&self) {
    self.shared.shutdown();
  }

  pub fn is_shut_down(&self) -> bool {
    self.shared.is_shut_down()
  }
}
