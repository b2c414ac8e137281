//! The concurrent map contract the cache is built over, and its default
//! sharded in-memory implementation.

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// A concurrent associative container with unique keys.
///
/// The cache owns one store for its whole lifetime and only ever goes through
/// this trait, so any concurrent map can back it. Implementations must allow
/// enumeration while other threads mutate the store; an enumeration may or
/// may not observe concurrent changes, but must never yield a key twice.
pub trait KeyValueStore<K, V>: Send + Sync {
  /// Returns a clone of the value stored under `key`.
  fn try_get(&self, key: &K) -> Option<V>;

  /// Stores `add_value` if `key` is absent, otherwise replaces the existing
  /// value with `update(key, existing)`. Returns the value now stored.
  fn add_or_update(&self, key: K, add_value: V, update: &mut dyn FnMut(&K, &V) -> V) -> V;

  /// Stores `value` only if `key` is absent. Returns whether it was stored.
  fn try_add(&self, key: K, value: V) -> bool;

  /// Removes and returns the value stored under `key`.
  fn try_remove(&self, key: &K) -> Option<V>;

  /// Removes the value stored under `key` only if `predicate` holds for it,
  /// as one atomic step.
  fn try_remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V>;

  /// The number of stored entries.
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Enumerates all entries.
  fn iter(&self) -> Box<dyn Iterator<Item = (K, V)> + '_>;
}

/// A store that is partitioned into multiple, independently locked shards.
///
/// Operations on different keys are unlikely to contend for the same lock,
/// and there is no lock covering the whole store.
pub struct InMemoryStore<K, V, H = ahash::RandomState> {
  shards: Box<[CachePadded<RwLock<HashMap<K, V, H>>>]>,
  hasher: H,
}

impl<K, V, H> fmt::Debug for InMemoryStore<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InMemoryStore")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K, V> InMemoryStore<K, V, ahash::RandomState>
where
  K: Eq + Hash,
{
  /// Creates a store with a shard count suited to this machine.
  pub fn new() -> Self {
    Self::with_hasher(default_shard_count(), ahash::RandomState::new())
  }
}

impl<K, V> Default for InMemoryStore<K, V, ahash::RandomState>
where
  K: Eq + Hash,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, H> InMemoryStore<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher + Clone,
{
  /// Creates a store with the given number of shards (rounded up to a power
  /// of two) and hasher. The hasher, together with `K`'s `Eq` and `Hash`,
  /// decides key equality.
  pub fn with_hasher(num_shards: usize, hasher: H) -> Self {
    let num_shards = num_shards.max(1).next_power_of_two();
    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      let shard_map = HashMap::with_hasher(hasher.clone());
      shards.push(CachePadded::new(RwLock::new(shard_map)));
    }

    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  fn shard(&self, key: &K) -> &RwLock<HashMap<K, V, H>> {
    let hash = self.hasher.hash_one(key);
    // The shard count is a power of two, so masking selects a shard.
    &self.shards[hash as usize & (self.shards.len() - 1)]
  }

  pub fn num_shards(&self) -> usize {
    self.shards.len()
  }
}

impl<K, V, H> KeyValueStore<K, V> for InMemoryStore<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync,
  V: Clone + Send + Sync,
  H: BuildHasher + Clone + Send + Sync,
{
  fn try_get(&self, key: &K) -> Option<V> {
    self.shard(key).read().get(key).cloned()
  }

  fn add_or_update(&self, key: K, add_value: V, update: &mut dyn FnMut(&K, &V) -> V) -> V {
    let mut guard = self.shard(&key).write();
    if let Some(existing) = guard.get_mut(&key) {
      let updated = update(&key, existing);
      *existing = updated.clone();
      return updated;
    }
    guard.insert(key, add_value.clone());
    add_value
  }

  fn try_add(&self, key: K, value: V) -> bool {
    let mut guard = self.shard(&key).write();
    if guard.contains_key(&key) {
      return false;
    }
    guard.insert(key, value);
    true
  }

  fn try_remove(&self, key: &K) -> Option<V> {
    self.shard(key).write().remove(key)
  }

  fn try_remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V> {
    let mut guard = self.shard(key).write();
    match guard.get(key) {
      Some(value) if predicate(value) => guard.remove(key),
      _ => None,
    }
  }

  fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.read().len()).sum()
  }

  fn iter(&self) -> Box<dyn Iterator<Item = (K, V)> + '_> {
    Box::new(ShardIter {
      shards: &self.shards,
      shard_index: 0,
      batch: Vec::new().into_iter(),
    })
  }
}

/// Walks the store one shard at a time, copying a shard's entries out under a
/// brief read lock and then yielding them without holding any lock.
///
/// Entries written to a shard after it has been copied are not seen.
struct ShardIter<'a, K, V, H> {
  shards: &'a [CachePadded<RwLock<HashMap<K, V, H>>>],
  shard_index: usize,
  batch: std::vec::IntoIter<(K, V)>,
}

impl<'a, K, V, H> Iterator for ShardIter<'a, K, V, H>
where
  K: Clone,
  V: Clone,
{
  type Item = (K, V);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(item) = self.batch.next() {
        return Some(item);
      }
      let shard = self.shards.get(self.shard_index)?;
      self.shard_index += 1;

      let guard = shard.read();
      self.batch = guard
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Vec<_>>()
        .into_iter();
    }
  }
}

pub(crate) fn default_shard_count() -> usize {
  (num_cpus::get() * 4).max(1).next_power_of_two()
}
