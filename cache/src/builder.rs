use crate::entry::CacheEntry;
use crate::error::{BuildError, LoaderError};
use crate::gate::KeyGates;
use crate::generation::GenerationKey;
use crate::handles::{Cache, SelfRefreshingCache};
#[cfg(feature = "tokio")]
use crate::handles::AsyncCache;
use crate::listener::{CacheListener, Disposable, Disposer, GenerationListener, RefreshListener};
use crate::loader::{self, AsyncLoader, Loader};
use crate::options::{CacheOptions, CircuitBreakerTimeout, SelfRefreshingCacheOptions};
use crate::shared::{CacheShared, RefreshShared};
use crate::store::{self, InMemoryStore, KeyValueStore};
use crate::task::janitor::Janitor;
use crate::task::refresher::Refresher;

use core::fmt;
#[cfg(feature = "tokio")]
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

type EntryStore<K, V> = Box<dyn KeyValueStore<K, Arc<CacheEntry<V>>>>;

/// A builder for creating [`Cache`] instances.
pub struct CacheBuilder<K, V, H = ahash::RandomState> {
  options: CacheOptions,
  shards: usize,
  hasher: H,
  store: Option<EntryStore<K, V>>,
  loader: Option<Loader<K, V>>,
  async_loader: Option<AsyncLoader<K, V>>,
  listener: Option<Arc<dyn CacheListener<K, V>>>,
  disposer: Option<Disposer<V>>,
}

// Manual Debug implementation for CacheBuilder.
impl<K, V, H> fmt::Debug for CacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("options", &self.options)
      .field("shards", &self.shards)
      .field("has_store", &self.store.is_some())
      .field("has_loader", &self.loader.is_some())
      .field("has_async_loader", &self.async_loader.is_some())
      .field("has_listener", &self.listener.is_some())
      .field("has_disposer", &self.disposer.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheBuilder<K, V> {
  /// Creates a builder with default options and the given cache name.
  pub fn new(cache_name: impl Into<String>) -> Self {
    Self::from_options(CacheOptions::named(cache_name))
  }

  /// Creates a builder from a complete set of options, e.g. ones read from
  /// a configuration file.
  pub fn from_options(options: CacheOptions) -> Self {
    Self {
      options,
      shards: store::default_shard_count(),
      hasher: ahash::RandomState::new(),
      store: None,
      loader: None,
      async_loader: None,
      listener: None,
      disposer: None,
    }
  }
}

impl<K, V> Default for CacheBuilder<K, V> {
  fn default() -> Self {
    Self::from_options(CacheOptions::default())
  }
}

// --- General Configuration Methods ---
// This impl block has no restrictive bounds on K or V.
impl<K, V, H> CacheBuilder<K, V, H> {
  /// Sets the number of entries a flush pass trims the cache down to.
  pub fn maximum_cache_size_indicator(mut self, size: usize) -> Self {
    self.options.maximum_cache_size_indicator = size;
    self
  }

  /// Sets how long a loaded entry stays fresh.
  pub fn cache_item_expiry(mut self, expiry: Duration) -> Self {
    self.options.cache_item_expiry = expiry;
    self
  }

  /// Sets the random spread applied to the expiry, in percent (0 to 100).
  pub fn cache_item_expiry_jitter_percent(mut self, percent: u8) -> Self {
    self.options.cache_item_expiry_jitter_percent = percent;
    self
  }

  /// Sets how often the background flush pass runs.
  pub fn flush_interval(mut self, interval: Duration) -> Self {
    self.options.flush_interval = interval;
    self
  }

  /// Sets how long a caller waits for a key another caller is loading.
  ///
  /// Accepts a [`CircuitBreakerTimeout`] or a plain `Duration`, where zero
  /// fails fast and `Duration::MAX` waits forever.
  pub fn circuit_breaker_timeout(mut self, timeout: impl Into<CircuitBreakerTimeout>) -> Self {
    self.options.circuit_breaker_timeout = timeout.into();
    self
  }

  /// Whether invalidated and evicted values are handed to the disposer.
  pub fn dispose_expired_values(mut self, dispose: bool) -> Self {
    self.options.dispose_expired_values = dispose;
    self
  }

  /// Sets the number of concurrent shards used by the default store and the
  /// key gate map.
  pub fn shards(mut self, shards: usize) -> Self {
    // Ensure shards is at least 1 and a power of two for fast bitwise ANDing.
    self.shards = shards.max(1).next_power_of_two();
    self
  }

  /// Sets the hasher of the default in-memory store.
  pub fn hasher<H2>(self, hasher: H2) -> CacheBuilder<K, V, H2> {
    CacheBuilder {
      options: self.options,
      shards: self.shards,
      hasher,
      store: self.store,
      loader: self.loader,
      async_loader: self.async_loader,
      listener: self.listener,
      disposer: self.disposer,
    }
  }

  /// Replaces the default in-memory store.
  pub fn store<S>(mut self, store: S) -> Self
  where
    S: KeyValueStore<K, Arc<CacheEntry<V>>> + 'static,
  {
    self.store = Some(Box::new(store));
    self
  }

  /// Sets the default loader used by `get_or_load`.
  pub fn loader<F, E>(mut self, f: F) -> Self
  where
    F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    E: Into<LoaderError> + 'static,
    K: 'static,
    V: 'static,
  {
    self.loader = Some(loader::boxed(f));
    self
  }

  /// Sets the default loader used by [`AsyncCache::get_or_load`]. An async
  /// cache without one falls back to the blocking loader.
  #[cfg(feature = "tokio")]
  pub fn async_loader<F, Fut, E>(mut self, f: F) -> Self
  where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    E: Into<LoaderError> + 'static,
    K: 'static,
    V: 'static,
  {
    self.async_loader = Some(loader::boxed_async(f));
    self
  }

  /// Sets the hit/miss/flush listener.
  pub fn listener<L>(mut self, listener: L) -> Self
  where
    L: CacheListener<K, V> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Sets the function that releases values leaving the cache. It only runs
  /// when `dispose_expired_values` is enabled.
  pub fn disposer<F>(mut self, f: F) -> Self
  where
    F: Fn(&V) + Send + Sync + 'static,
  {
    self.disposer = Some(Arc::new(f));
    self
  }

  /// Uses [`Disposable::dispose`] as the disposer.
  pub fn disposable(self) -> Self
  where
    V: Disposable + 'static,
  {
    self.disposer(|value: &V| value.dispose())
  }
}

impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Validates the options, creates the cache and starts its janitor.
  pub fn build(self) -> Result<Cache<K, V>, BuildError> {
    self.options.validate()?;
    let store: EntryStore<K, V> = match self.store {
      Some(store) => store,
      None => Box::new(InMemoryStore::with_hasher(self.shards, self.hasher)),
    };
    build_cache(
      self.options,
      store,
      self.shards,
      self.loader,
      self.async_loader,
      self.listener,
      self.disposer,
    )
  }

  /// Like [`build`](Self::build), returning the async handle. The janitor
  /// still runs on its own thread, so no runtime is needed to build.
  #[cfg(feature = "tokio")]
  pub fn build_async(self) -> Result<AsyncCache<K, V>, BuildError> {
    self.build().map(|cache| cache.to_async())
  }
}

/// Central logic to construct a cache from validated options.
fn build_cache<K, V>(
  options: CacheOptions,
  store: EntryStore<K, V>,
  shards: usize,
  loader: Option<Loader<K, V>>,
  async_loader: Option<AsyncLoader<K, V>>,
  listener: Option<Arc<dyn CacheListener<K, V>>>,
  disposer: Option<Disposer<V>>,
) -> Result<Cache<K, V>, BuildError>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  let gates = KeyGates::new(shards, ahash::RandomState::new());
  let shared = Arc::new(CacheShared::new(
    options,
    store,
    gates,
    loader,
    async_loader,
    listener,
    disposer,
  ));

  let janitor = Janitor::spawn(&shared)?;
  *shared.janitor.lock() = Some(janitor);

  Ok(Cache { shared })
}

/// A builder for creating [`SelfRefreshingCache`] instances.
///
/// A loader is required: the refresher needs to reload every generation the
/// same way.
pub struct SelfRefreshingCacheBuilder<K, V, H = ahash::RandomState> {
  options: SelfRefreshingCacheOptions,
  shards: usize,
  hasher: H,
  store: Option<EntryStore<GenerationKey<K>, V>>,
  loader: Option<Loader<K, V>>,
  listener: Option<Arc<dyn CacheListener<K, V>>>,
  refresh_listener: Option<Arc<dyn RefreshListener>>,
  disposer: Option<Disposer<V>>,
}

impl<K, V, H> fmt::Debug for SelfRefreshingCacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SelfRefreshingCacheBuilder")
      .field("options", &self.options)
      .field("shards", &self.shards)
      .field("has_store", &self.store.is_some())
      .field("has_loader", &self.loader.is_some())
      .field("has_listener", &self.listener.is_some())
      .field("has_refresh_listener", &self.refresh_listener.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V> SelfRefreshingCacheBuilder<K, V> {
  pub fn new(cache_name: impl Into<String>) -> Self {
    let mut options = SelfRefreshingCacheOptions::default();
    options.cache.cache_name = cache_name.into();
    Self::from_options(options)
  }

  pub fn from_options(options: SelfRefreshingCacheOptions) -> Self {
    Self {
      options,
      shards: store::default_shard_count(),
      hasher: ahash::RandomState::new(),
      store: None,
      loader: None,
      listener: None,
      refresh_listener: None,
      disposer: None,
    }
  }
}

impl<K, V, H> SelfRefreshingCacheBuilder<K, V, H> {
  /// Sets how often the next generation is loaded and swapped in. Must be at
  /// most half of the item expiry.
  pub fn refresh_interval(mut self, interval: Duration) -> Self {
    self.options.refresh_interval = interval;
    self
  }

  pub fn maximum_cache_size_indicator(mut self, size: usize) -> Self {
    self.options.cache.maximum_cache_size_indicator = size;
    self
  }

  pub fn cache_item_expiry(mut self, expiry: Duration) -> Self {
    self.options.cache.cache_item_expiry = expiry;
    self
  }

  pub fn cache_item_expiry_jitter_percent(mut self, percent: u8) -> Self {
    self.options.cache.cache_item_expiry_jitter_percent = percent;
    self
  }

  pub fn flush_interval(mut self, interval: Duration) -> Self {
    self.options.cache.flush_interval = interval;
    self
  }

  pub fn circuit_breaker_timeout(mut self, timeout: impl Into<CircuitBreakerTimeout>) -> Self {
    self.options.cache.circuit_breaker_timeout = timeout.into();
    self
  }

  pub fn dispose_expired_values(mut self, dispose: bool) -> Self {
    self.options.cache.dispose_expired_values = dispose;
    self
  }

  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards.max(1).next_power_of_two();
    self
  }

  pub fn hasher<H2>(self, hasher: H2) -> SelfRefreshingCacheBuilder<K, V, H2> {
    SelfRefreshingCacheBuilder {
      options: self.options,
      shards: self.shards,
      hasher,
      store: self.store,
      loader: self.loader,
      listener: self.listener,
      refresh_listener: self.refresh_listener,
      disposer: self.disposer,
    }
  }

  /// Replaces the default in-memory store of the generation cache. Entries
  /// of every generation live in it, keyed by `(key, generation)`.
  pub fn store<S>(mut self, store: S) -> Self
  where
    S: KeyValueStore<GenerationKey<K>, Arc<CacheEntry<V>>> + 'static,
  {
    self.store = Some(Box::new(store));
    self
  }

  pub fn loader<F, E>(mut self, f: F) -> Self
  where
    F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    E: Into<LoaderError> + 'static,
    K: 'static,
    V: 'static,
  {
    self.loader = Some(loader::boxed(f));
    self
  }

  /// Sets the hit/miss/flush listener. Callbacks receive user keys.
  pub fn listener<L>(mut self, listener: L) -> Self
  where
    L: CacheListener<K, V> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }

  pub fn refresh_listener<L>(mut self, listener: L) -> Self
  where
    L: RefreshListener + 'static,
  {
    self.refresh_listener = Some(Arc::new(listener));
    self
  }

  pub fn disposer<F>(mut self, f: F) -> Self
  where
    F: Fn(&V) + Send + Sync + 'static,
  {
    self.disposer = Some(Arc::new(f));
    self
  }

  pub fn disposable(self) -> Self
  where
    V: Disposable + 'static,
  {
    self.disposer(|value: &V| value.dispose())
  }
}

impl<K, V, H> SelfRefreshingCacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Validates the options, creates the generation cache and starts both the
  /// janitor and the refresher.
  pub fn build(self) -> Result<SelfRefreshingCache<K, V>, BuildError> {
    self.options.validate()?;
    let loader = self.loader.ok_or(BuildError::LoaderRequired)?;

    let generation_loader: Loader<GenerationKey<K>, V> =
      Arc::new(move |key: &GenerationKey<K>| loader(&key.key));
    let listener = self.listener.map(|inner| {
      Arc::new(GenerationListener { inner }) as Arc<dyn CacheListener<GenerationKey<K>, V>>
    });
    let store: EntryStore<GenerationKey<K>, V> = match self.store {
      Some(store) => store,
      None => Box::new(InMemoryStore::with_hasher(self.shards, self.hasher)),
    };

    let generations = build_cache(
      self.options.cache.clone(),
      store,
      self.shards,
      Some(generation_loader),
      None,
      listener,
      self.disposer,
    )?;

    let shared = Arc::new(RefreshShared::new(
      generations,
      self.options,
      self.refresh_listener,
    ));
    let refresher = Refresher::spawn(&shared)?;
    *shared.refresher.lock() = Some(refresher);

    Ok(SelfRefreshingCache { shared })
  }
}
