use crate::error::{CacheError, LoaderError};
use crate::generation::{Generation, GenerationKey};
use crate::iter::GenerationIter;
use crate::options::SelfRefreshingCacheOptions;
use crate::shared::RefreshShared;
use crate::task::janitor::FlushOutcome;
use crate::task::refresher;
use crate::MetricsSnapshot;

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// A cache that keeps its hot entries warm.
///
/// Entries live in an internal cache keyed by `(key, generation)`. On every
/// refresh interval a background thread reloads the most recently accessed
/// keys of the current generation into the next one, then makes the next
/// generation current in one atomic step and invalidates the old one. Readers
/// therefore keep hitting warm entries instead of stalling on expiry.
///
/// Reads check the next generation first, so a key that has already been
/// migrated is served from its fresher copy.
pub struct SelfRefreshingCache<K, V> {
  pub(crate) shared: Arc<RefreshShared<K, V>>,
}

impl<K, V> fmt::Debug for SelfRefreshingCache<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SelfRefreshingCache")
      .field("shared", &self.shared)
      .finish()
  }
}

impl<K, V> SelfRefreshingCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  #[inline]
  fn current_key(&self, key: &K) -> GenerationKey<K> {
    GenerationKey::new(key.clone(), self.shared.current_generation())
  }

  /// Looks `key` up in the next generation. `None` means absent there.
  fn read_next_generation(&self, key: &K, reset_expiry: bool) -> Option<Arc<V>> {
    let next = self.shared.current_generation().next();
    self
      .shared
      .generations
      .shared
      .lookup(&GenerationKey::new(key.clone(), next), reset_expiry)
      .map(|entry| entry.value().clone())
  }

  pub fn get(&self, key: &K) -> Option<Arc<V>> {
    self.get_with_reset(key, false)
  }

  pub fn get_with_reset(&self, key: &K, reset_expiry: bool) -> Option<Arc<V>> {
    if let Some(value) = self.read_next_generation(key, reset_expiry) {
      return Some(value);
    }
    self
      .shared
      .generations
      .get_with_reset(&self.current_key(key), reset_expiry)
  }

  /// Returns the value for `key`, loading it into the current generation on a miss.
  pub fn get_or_load(&self, key: &K) -> Result<Arc<V>, CacheError> {
    self.get_or_load_with_reset(key, false)
  }

  pub fn get_or_load_with_reset(&self, key: &K, reset_expiry: bool) -> Result<Arc<V>, CacheError> {
    if let Some(value) = self.read_next_generation(key, reset_expiry) {
      return Ok(value);
    }
    self
      .shared
      .generations
      .get_or_load_with_reset(&self.current_key(key), reset_expiry)
  }

  /// Always fails with [`CacheError::NotSupported`]: every generation must be
  /// loaded by the loader the cache was built with.
  pub fn get_or_load_with<F, E>(&self, key: &K, loader: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Into<LoaderError>,
  {
    self.get_or_load_using(key, false, loader)
  }

  /// Always fails with [`CacheError::NotSupported`].
  pub fn get_or_load_using<F, E>(
    &self,
    _key: &K,
    _reset_expiry: bool,
    _loader: F,
  ) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Into<LoaderError>,
  {
    Err(CacheError::NotSupported)
  }

  /// Stores `value` in the current generation without loading.
  pub fn try_add(&self, key: K, value: V) -> bool {
    let generation = self.shared.current_generation();
    self
      .shared
      .generations
      .try_add(GenerationKey::new(key, generation), value)
  }

  /// Removes `key` from the current generation, and from the next one if a
  /// refresh has already migrated it there.
  pub fn invalidate(&self, key: &K) -> bool {
    let current = self.shared.current_generation();
    let generations = &self.shared.generations;
    let in_current = generations.invalidate(&GenerationKey::new(key.clone(), current));
    let in_next = generations.invalidate(&GenerationKey::new(key.clone(), current.next()));
    in_current || in_next
  }

  /// Removes every entry of every generation.
  pub fn invalidate_all(&self) {
    self.shared.generations.invalidate_all();
  }

  pub fn has_key(&self, key: &K) -> bool {
    let current = self.shared.current_generation();
    let generations = &self.shared.generations;
    generations.has_key(&GenerationKey::new(key.clone(), current))
      || generations.has_key(&GenerationKey::new(key.clone(), current.next()))
  }

  /// Runs a flush pass on the underlying generation cache.
  pub fn flush_invalidated_entries(&self) -> FlushOutcome {
    self.shared.generations.flush_invalidated_entries()
  }

  /// The number of entries in the current generation.
  pub fn count(&self) -> usize {
    self.items().count()
  }

  /// Iterates over the entries of the current generation.
  pub fn items(&self) -> GenerationIter<'_, K, V> {
    GenerationIter::new(
      self.shared.generations.shared.store.iter(),
      self.shared.current_generation(),
    )
  }

  pub fn current_generation(&self) -> Generation {
    self.shared.current_generation()
  }

  /// Runs a refresh cycle now instead of waiting for the refresh interval,
  /// returning the generation that became current.
  ///
  /// Cycles never overlap: if the background refresher is mid-cycle this
  /// waits for it to finish first.
  pub fn refresh(&self) -> Result<Generation, CacheError> {
    refresher::run_refresh_cycle(&self.shared)
  }

  pub fn name(&self) -> &str {
    self.shared.name()
  }

  pub fn options(&self) -> &SelfRefreshingCacheOptions {
    &self.shared.options
  }

  /// Metrics of the underlying generation cache, including refresh cycles.
  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.generations.metrics()
  }

  /// Stops the refresher, then shuts the generation cache down. Idempotent.
  pub fn shutdown(&self) {
    if self.shared.stop_refresher() {
      tracing::debug!(cache = %self.shared.name(), "self-refreshing cache shut down");
    }
    self.shared.generations.shutdown();
  }

  pub fn is_shut_down(&self) -> bool {
    self.shared.is_shut_down()
  }
}
