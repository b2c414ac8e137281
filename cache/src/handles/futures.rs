use crate::error::{CacheError, LoaderError};
use crate::iter::Iter;
use crate::metrics::Metrics;
use crate::options::CacheOptions;
use crate::shared::CacheShared;
use crate::task::janitor::{self, FlushOutcome};
use crate::{Cache, MetricsSnapshot};

use std::fmt;
use std::future::{self, Future};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

/// An asynchronous handle to a cache.
///
/// Misses on the same key still run one loader at a time, whether the other
/// callers are tasks on this handle or threads on a [`Cache`] view of the
/// same cache: both wait on the same per-key gate. Waiting tasks yield to
/// the runtime instead of blocking it, bounded by the circuit breaker
/// timeout. Bounded timeouts need a tokio runtime with the time driver.
///
/// Hits, `try_add` and invalidation never wait and are plain methods.
pub struct AsyncCache<K, V> {
  pub(crate) shared: Arc<CacheShared<K, V>>,
}

impl<K, V> fmt::Debug for AsyncCache<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AsyncCache")
      .field("shared", &self.shared)
      .finish()
  }
}

impl<K, V> AsyncCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  /// Returns a blocking handle to the same cache. This is a zero-cost
  /// conversion.
  pub fn to_sync(&self) -> Cache<K, V> {
    Cache {
      shared: self.shared.clone(),
    }
  }

  /// Returns the value for `key` if a fresh entry is present.
  pub fn get(&self, key: &K) -> Option<Arc<V>> {
    self.get_with_reset(key, false)
  }

  pub fn get_with_reset(&self, key: &K, reset_expiry: bool) -> Option<Arc<V>> {
    match self.shared.lookup(key, reset_expiry) {
      Some(entry) => Some(entry.value().clone()),
      None => {
        Metrics::incr(&self.shared.metrics.misses);
        None
      }
    }
  }

  /// Returns the value for `key`, awaiting the cache's async loader on a miss.
  ///
  /// A cache built without an async loader runs its blocking loader on the
  /// current task instead.
  pub async fn get_or_load(&self, key: &K) -> Result<Arc<V>, CacheError> {
    self.get_or_load_with_reset(key, false).await
  }

  pub async fn get_or_load_with_reset(
    &self,
    key: &K,
    reset_expiry: bool,
  ) -> Result<Arc<V>, CacheError> {
    if let Some(loader) = self.shared.async_loader.clone() {
      return self
        .load(key, reset_expiry, move |key: &K| loader(key.clone()))
        .await;
    }
    let loader = self
      .shared
      .loader
      .clone()
      .ok_or_else(|| self.shared.no_loader())?;
    self
      .load(key, reset_expiry, move |key: &K| future::ready(loader(key)))
      .await
  }

  /// Returns the value for `key`, awaiting `loader` instead of the cache's
  /// loader on a miss.
  pub async fn get_or_load_with<F, Fut, E>(&self, key: &K, loader: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Into<LoaderError>,
  {
    self.get_or_load_using(key, false, loader).await
  }

  pub async fn get_or_load_using<F, Fut, E>(
    &self,
    key: &K,
    reset_expiry: bool,
    loader: F,
  ) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Into<LoaderError>,
  {
    self.load(key, reset_expiry, loader).await
  }

  /// The single-flight load protocol, awaiting the gate and the loader.
  async fn load<F, Fut, E>(&self, key: &K, reset_expiry: bool, loader: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Into<LoaderError>,
  {
    if let Some(entry) = self.shared.lookup(key, reset_expiry) {
      return Ok(entry.value().clone());
    }

    let gate = self.shared.gates.gate_for(key);
    let timeout = self.shared.options.circuit_breaker_timeout;
    let Some(_permit) = gate.acquire_async(timeout).await else {
      return Err(self.shared.circuit_breaker_tripped(key));
    };

    if let Some(entry) = self.shared.lookup(key, reset_expiry) {
      return Ok(entry.value().clone());
    }

    Metrics::incr(&self.shared.metrics.misses);
    let started = Instant::now();
    let loaded = loader(key).await.map_err(Into::into);
    self.shared.store_loaded(key, loaded, started.elapsed())
  }

  /// Stores `value` without loading. Returns `false` if an entry for `key`
  /// is already present.
  pub fn try_add(&self, key: K, value: V) -> bool {
    self.to_sync().try_add(key, value)
  }

  pub fn invalidate(&self, key: &K) -> bool {
    self.shared.invalidate(key)
  }

  pub fn invalidate_all(&self) {
    self.shared.invalidate_all();
  }

  pub fn has_key(&self, key: &K) -> bool {
    self.shared.store.try_get(key).is_some()
  }

  /// Runs a flush pass on the calling thread.
  pub fn flush_invalidated_entries(&self) -> FlushOutcome {
    janitor::flush_invalidated_entries(&self.shared)
  }

  pub fn count(&self) -> usize {
    self.shared.store.len()
  }

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

  pub fn shutdown(&self) {
    self.shared.shutdown();
  }

  pub fn is_shut_down(&self) -> bool {
    self.shared.is_shut_down()
  }
}
