use crate::entry::{self, CacheEntry};
use crate::error::{CacheError, LoaderError};
use crate::gate::KeyGates;
use crate::generation::{Generation, GenerationKey};
use crate::handles::Cache;
use crate::listener::{self, CacheListener, Disposer, RefreshListener};
use crate::loader::{AsyncLoader, Loader};
use crate::metrics::Metrics;
use crate::options::{CacheOptions, SelfRefreshingCacheOptions};
use crate::store::KeyValueStore;
use crate::task::janitor::Janitor;
use crate::task::refresher::Refresher;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// The internal, thread-safe core of the cache.
pub(crate) struct CacheShared<K, V> {
  pub(crate) options: CacheOptions,
  pub(crate) store: Box<dyn KeyValueStore<K, Arc<CacheEntry<V>>>>,
  pub(crate) gates: KeyGates<K>,
  pub(crate) loader: Option<Loader<K, V>>,
  #[cfg_attr(not(feature = "tokio"), allow(dead_code))]
  pub(crate) async_loader: Option<AsyncLoader<K, V>>,
  pub(crate) listener: Option<Arc<dyn CacheListener<K, V>>>,
  pub(crate) disposer: Option<Disposer<V>>,
  pub(crate) metrics: Metrics,
  /// Held for the duration of a flush pass so passes never overlap.
  pub(crate) flush_lock: Mutex<()>,
  pub(crate) janitor: Mutex<Option<Janitor>>,
  shut_down: AtomicBool,
}

impl<K, V> fmt::Debug for CacheShared<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheShared")
      .field("options", &self.options)
      .field("len", &self.store.len())
      .field("gates", &self.gates.len())
      .field("has_loader", &self.loader.is_some())
      .field("has_async_loader", &self.async_loader.is_some())
      .field("has_listener", &self.listener.is_some())
      .field("metrics", &self.metrics.snapshot())
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheShared<K, V>
where
  K: Eq + Hash + Clone,
{
  pub(crate) fn new(
    options: CacheOptions,
    store: Box<dyn KeyValueStore<K, Arc<CacheEntry<V>>>>,
    gates: KeyGates<K>,
    loader: Option<Loader<K, V>>,
    async_loader: Option<AsyncLoader<K, V>>,
    listener: Option<Arc<dyn CacheListener<K, V>>>,
    disposer: Option<Disposer<V>>,
  ) -> Self {
    Self {
      options,
      store,
      gates,
      loader,
      async_loader,
      listener,
      disposer,
      metrics: Metrics::new(),
      flush_lock: Mutex::new(()),
      janitor: Mutex::new(None),
      shut_down: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn name(&self) -> &str {
    &self.options.cache_name
  }

  /// Draws the time-to-live for an entry written now.
  pub(crate) fn sample_ttl(&self) -> Duration {
    entry::jittered_ttl(
      self.options.cache_item_expiry,
      self.options.cache_item_expiry_jitter_percent,
      &mut rand::rng(),
    )
  }

  pub(crate) fn new_entry(&self, value: Arc<V>) -> Arc<CacheEntry<V>> {
    Arc::new(CacheEntry::new(value, self.sample_ttl()))
  }

  /// Returns the fresh entry for `key`, recording the hit. A miss has no side
  /// effects.
  pub(crate) fn lookup(&self, key: &K, reset_expiry: bool) -> Option<Arc<CacheEntry<V>>> {
    let entry = self.store.try_get(key)?;
    if entry.is_stale() {
      return None;
    }

    entry.touch();
    if reset_expiry {
      entry.reset_expiry();
    }
    Metrics::incr(&self.metrics.hits);
    if let Some(listener) = &self.listener {
      listener::guarded(self.name(), "on_hit", || listener.on_hit(key, &entry));
    }
    Some(entry)
  }

  /// Stores what the loader produced for `key`, which the caller loaded
  /// while holding its gate. A failed load stores nothing.
  pub(crate) fn store_loaded(
    &self,
    key: &K,
    loaded: Result<V, LoaderError>,
    load_duration: Duration,
  ) -> Result<Arc<V>, CacheError> {
    let value = match loaded {
      Ok(value) => value,
      Err(e) => {
        Metrics::incr(&self.metrics.load_failures);
        return Err(CacheError::Loader(e));
      }
    };
    Metrics::incr(&self.metrics.loads);

    let entry = self.new_entry(Arc::new(value));
    let mut replaced = None;
    self
      .store
      .add_or_update(key.clone(), entry.clone(), &mut |_, stale| {
        replaced = Some(stale.clone());
        entry.clone()
      });
    if let Some(stale) = replaced {
      if !Arc::ptr_eq(stale.value(), entry.value()) {
        self.dispose(stale.value());
      }
    }

    if let Some(listener) = &self.listener {
      listener::guarded(self.name(), "on_miss", || {
        listener.on_miss(key, &entry, load_duration)
      });
    }
    Ok(entry.value().clone())
  }

  /// Counts a caller that gave up waiting for `key`'s gate and builds its error.
  pub(crate) fn circuit_breaker_tripped(&self, key: &K) -> CacheError
  where
    K: fmt::Debug,
  {
    Metrics::incr(&self.metrics.circuit_breaker_timeouts);
    CacheError::CircuitBreakerTimeout {
      cache: self.name().to_string(),
      key: format!("{key:?}"),
      timeout: self.options.circuit_breaker_timeout,
    }
  }

  pub(crate) fn no_loader(&self) -> CacheError {
    CacheError::NoLoader(self.name().to_string())
  }

  /// Releases a value that left the cache, if disposal is enabled.
  pub(crate) fn dispose(&self, value: &Arc<V>) {
    if !self.options.dispose_expired_values {
      return;
    }
    if let Some(disposer) = &self.disposer {
      listener::guarded(self.name(), "dispose", || disposer(value));
    }
  }

  /// Removes `key` only if it still maps to `expected`. Returns whether it did.
  pub(crate) fn remove_exact(&self, key: &K, expected: &Arc<CacheEntry<V>>) -> bool {
    let removed = self
      .store
      .try_remove_if(key, &|current| Arc::ptr_eq(current, expected));
    match removed {
      Some(entry) => {
        self.dispose(entry.value());
        true
      }
      None => false,
    }
  }

  pub(crate) fn invalidate(&self, key: &K) -> bool {
    match self.store.try_remove(key) {
      Some(entry) => {
        Metrics::incr(&self.metrics.invalidations);
        self.dispose(entry.value());
        true
      }
      None => false,
    }
  }

  /// Removes every entry one key at a time, never locking the whole store.
  pub(crate) fn invalidate_all(&self) -> usize {
    let keys: Vec<K> = self.store.iter().map(|(key, _)| key).collect();
    keys.iter().filter(|key| self.invalidate(key)).count()
  }

  pub(crate) fn is_shut_down(&self) -> bool {
    self.shut_down.load(Ordering::Acquire)
  }

  /// Stops the janitor, releases all gates and invalidates all entries.
  /// Only the first call has any effect.
  pub(crate) fn shutdown(&self) {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return;
    }

    if let Some(janitor) = self.janitor.lock().take() {
      janitor.stop();
    }
    let gates = self.gates.clear();
    let invalidated = self.invalidate_all();

    tracing::debug!(
      cache = %self.name(),
      gates,
      invalidated,
      "cache shut down"
    );
  }
}

impl<K, V> Drop for CacheShared<K, V> {
  fn drop(&mut self) {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(janitor) = self.janitor.get_mut().take() {
      janitor.stop();
    }
    // Dropped without an explicit shutdown: hand remaining values to the disposer.
    if self.options.dispose_expired_values {
      if let Some(disposer) = &self.disposer {
        for (_, entry) in self.store.iter() {
          listener::guarded(&self.options.cache_name, "dispose", || disposer(entry.value()));
        }
      }
    }
    tracing::debug!(cache = %self.options.cache_name, "cache dropped");
  }
}

/// The internal core of a [`SelfRefreshingCache`](crate::SelfRefreshingCache).
pub(crate) struct RefreshShared<K, V> {
  /// Every generation lives in this one cache, keyed by `(key, generation)`.
  pub(crate) generations: Cache<GenerationKey<K>, V>,
  current: AtomicU32,
  pub(crate) options: SelfRefreshingCacheOptions,
  pub(crate) listener: Option<Arc<dyn RefreshListener>>,
  /// Held for the duration of a refresh cycle so cycles never overlap.
  pub(crate) cycle_lock: Mutex<()>,
  pub(crate) refresher: Mutex<Option<Refresher>>,
  shut_down: AtomicBool,
}

impl<K, V> fmt::Debug for RefreshShared<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefreshShared")
      .field("current", &self.current_generation())
      .field("refresh_interval", &self.options.refresh_interval)
      .field("generations", &self.generations)
      .finish_non_exhaustive()
  }
}

impl<K, V> RefreshShared<K, V> {
  pub(crate) fn new(
    generations: Cache<GenerationKey<K>, V>,
    options: SelfRefreshingCacheOptions,
    listener: Option<Arc<dyn RefreshListener>>,
  ) -> Self {
    Self {
      generations,
      current: AtomicU32::new(Generation::ZERO.get()),
      options,
      listener,
      cycle_lock: Mutex::new(()),
      refresher: Mutex::new(None),
      shut_down: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn current_generation(&self) -> Generation {
    Generation(self.current.load(Ordering::Acquire))
  }

  /// Makes `next` current in a single atomic step, returning the generation
  /// it replaced.
  pub(crate) fn swap_generation(&self, next: Generation) -> Generation {
    Generation(self.current.swap(next.get(), Ordering::AcqRel))
  }

  #[cfg(test)]
  pub(crate) fn set_generation(&self, generation: Generation) {
    self.current.store(generation.get(), Ordering::Release);
  }

  pub(crate) fn name(&self) -> &str {
    &self.options.cache.cache_name
  }

  pub(crate) fn is_shut_down(&self) -> bool {
    self.shut_down.load(Ordering::Acquire)
  }

  /// Marks the cache shut down and stops the refresher. Returns `false` if
  /// this had already happened.
  pub(crate) fn stop_refresher(&self) -> bool {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return false;
    }
    if let Some(refresher) = self.refresher.lock().take() {
      refresher.stop();
    }
    true
  }
}

impl<K, V> Drop for RefreshShared<K, V> {
  fn drop(&mut self) {
    if self.stop_refresher() {
      tracing::debug!(cache = %self.name(), "self-refreshing cache dropped");
    }
  }
}
