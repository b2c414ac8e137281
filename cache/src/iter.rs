//! Contains types for iterating over a cache's contents.

use crate::entry::CacheEntry;
use crate::generation::{Generation, GenerationKey};

use std::fmt;
use std::sync::Arc;

type EntryIter<'a, K, V> = Box<dyn Iterator<Item = (K, Arc<CacheEntry<V>>)> + 'a>;

/// An iterator over the key-value pairs of a [`Cache`](crate::Cache).
///
/// This iterator is designed for low-impact, concurrent-friendly iteration:
/// it holds a lock on at most one shard at a time, and only briefly.
///
/// **Important**: it does **not** provide a point-in-time snapshot of the
/// cache. Items inserted after a shard has been scanned will be missed, and
/// items may be invalidated by other threads while iteration is in progress.
/// No key is yielded twice.
pub struct Iter<'a, K, V> {
  inner: EntryIter<'a, K, V>,
}

impl<'a, K, V> Iter<'a, K, V> {
  pub(crate) fn new(inner: EntryIter<'a, K, V>) -> Self {
    Self { inner }
  }
}

impl<K, V> Iterator for Iter<'_, K, V> {
  type Item = (K, Arc<V>);

  fn next(&mut self) -> Option<Self::Item> {
    self
      .inner
      .next()
      .map(|(key, entry)| (key, entry.value().clone()))
  }
}

impl<K, V> fmt::Debug for Iter<'_, K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Iter").finish_non_exhaustive()
  }
}

/// An iterator over the entries of one generation of a
/// [`SelfRefreshingCache`](crate::SelfRefreshingCache), yielding user keys.
pub struct GenerationIter<'a, K, V> {
  inner: EntryIter<'a, GenerationKey<K>, V>,
  generation: Generation,
}

impl<'a, K, V> GenerationIter<'a, K, V> {
  pub(crate) fn new(inner: EntryIter<'a, GenerationKey<K>, V>, generation: Generation) -> Self {
    Self { inner, generation }
  }
}

impl<K, V> Iterator for GenerationIter<'_, K, V> {
  type Item = (K, Arc<V>);

  fn next(&mut self) -> Option<Self::Item> {
    let generation = self.generation;
    self
      .inner
      .by_ref()
      .find(|(key, _)| key.generation == generation)
      .map(|(key, entry)| (key.key, entry.value().clone()))
  }
}

impl<K, V> fmt::Debug for GenerationIter<'_, K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GenerationIter")
      .field("generation", &self.generation)
      .finish_non_exhaustive()
  }
}
