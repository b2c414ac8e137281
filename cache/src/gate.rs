//! Per-key gates that serialize concurrent loads of the same key.

use crate::options::CircuitBreakerTimeout;

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// A binary semaphore guarding the "check store, load, write store"
/// sequence for a single key.
///
/// Blocking callers park on a condvar. With the `tokio` feature, async
/// callers wait on a `Notify` instead, so both kinds of caller contend for
/// the same gate and a key is never loaded by a thread and a task at once.
#[derive(Default)]
pub(crate) struct KeyGate {
  held: Mutex<bool>,
  released: Condvar,
  #[cfg(feature = "tokio")]
  released_async: tokio::sync::Notify,
}

/// Holding a permit is what entitles a caller to run the loader for a key.
/// Dropping it releases the gate.
pub(crate) struct GatePermit<'a> {
  gate: &'a KeyGate,
}

impl Drop for GatePermit<'_> {
  fn drop(&mut self) {
    *self.gate.held.lock() = false;
    self.gate.released.notify_one();
    #[cfg(feature = "tokio")]
    self.gate.released_async.notify_one();
  }
}

impl KeyGate {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn try_acquire(&self) -> Option<GatePermit<'_>> {
    let mut held = self.held.lock();
    if *held {
      return None;
    }
    *held = true;
    Some(GatePermit { gate: self })
  }

  /// Tries to take the gate, giving up according to `timeout`.
  ///
  /// Returns `None` if the gate could not be taken in time. The current
  /// holder is not affected either way.
  pub(crate) fn acquire(&self, timeout: CircuitBreakerTimeout) -> Option<GatePermit<'_>> {
    let mut held = self.held.lock();
    match timeout {
      CircuitBreakerTimeout::FailFast => {
        if *held {
          return None;
        }
      }
      CircuitBreakerTimeout::After(duration) => {
        let deadline = Instant::now().checked_add(duration);
        while *held {
          match deadline {
            Some(deadline) => {
              if self.released.wait_until(&mut held, deadline).timed_out() && *held {
                return None;
              }
            }
            None => self.released.wait(&mut held),
          }
        }
      }
      CircuitBreakerTimeout::Forever => {
        while *held {
          self.released.wait(&mut held);
        }
      }
    }
    *held = true;
    Some(GatePermit { gate: self })
  }

  /// The async counterpart of [`acquire`](Self::acquire). Needs a tokio
  /// runtime with the time driver for bounded waits.
  #[cfg(feature = "tokio")]
  pub(crate) async fn acquire_async(&self, timeout: CircuitBreakerTimeout) -> Option<GatePermit<'_>> {
    match timeout {
      CircuitBreakerTimeout::FailFast => self.try_acquire(),
      CircuitBreakerTimeout::After(duration) => {
        tokio::time::timeout(duration, self.acquire_when_released())
          .await
          .ok()
      }
      CircuitBreakerTimeout::Forever => Some(self.acquire_when_released().await),
    }
  }

  #[cfg(feature = "tokio")]
  async fn acquire_when_released(&self) -> GatePermit<'_> {
    loop {
      let mut notified = std::pin::pin!(self.released_async.notified());
      // Register before checking, so a release in between is not missed.
      notified.as_mut().enable();
      if let Some(permit) = self.try_acquire() {
        return permit;
      }
      notified.await;
    }
  }

  #[cfg(test)]
  pub(crate) fn is_held(&self) -> bool {
    *self.held.lock()
  }
}

impl fmt::Debug for KeyGate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyGate")
      .field("held", &*self.held.lock())
      .finish()
  }
}

/// The lazily populated map from key to gate.
///
/// Gates are created on first use and kept until the key is no longer
/// meaningful ([`KeyGates::retain`]) or the cache shuts down
/// ([`KeyGates::clear`]), so repeated loads of a key reuse the same gate.
pub(crate) struct KeyGates<K, H = ahash::RandomState> {
  shards: Box<[CachePadded<Mutex<HashMap<K, Arc<KeyGate>, H>>>]>,
  hasher: H,
}

impl<K, H> KeyGates<K, H> {
  pub(crate) fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.lock().len()).sum()
  }

  /// Releases every gate, returning how many there were.
  ///
  /// Callers still holding an `Arc<KeyGate>` keep a working gate; the next
  /// `gate_for` on that key creates a fresh one.
  pub(crate) fn clear(&self) -> usize {
    let mut released = 0;
    for shard in self.shards.iter() {
      let mut guard = shard.lock();
      released += guard.len();
      guard.clear();
    }
    released
  }
}

impl<K, H> KeyGates<K, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    let num_shards = num_shards.max(1).next_power_of_two();
    let shards = (0..num_shards)
      .map(|_| CachePadded::new(Mutex::new(HashMap::with_hasher(hasher.clone()))))
      .collect::<Vec<_>>()
      .into_boxed_slice();

    Self { shards, hasher }
  }

  #[inline]
  fn shard(&self, key: &K) -> &Mutex<HashMap<K, Arc<KeyGate>, H>> {
    let hash = self.hasher.hash_one(key);
    &self.shards[hash as usize & (self.shards.len() - 1)]
  }

  /// Returns the gate for `key`, inserting one if absent. Every caller racing
  /// on the same key gets the same gate.
  pub(crate) fn gate_for(&self, key: &K) -> Arc<KeyGate> {
    let mut shard = self.shard(key).lock();
    if let Some(gate) = shard.get(key) {
      return Arc::clone(gate);
    }
    let gate = Arc::new(KeyGate::new());
    shard.insert(key.clone(), Arc::clone(&gate));
    gate
  }

  /// Keeps only the gates whose key satisfies `keep`, returning how many
  /// were dropped. Used for keys that will never be loaded again.
  pub(crate) fn retain(&self, mut keep: impl FnMut(&K) -> bool) -> usize {
    let mut dropped = 0;
    for shard in self.shards.iter() {
      let mut guard = shard.lock();
      let before = guard.len();
      guard.retain(|key, _| keep(key));
      dropped += before - guard.len();
    }
    dropped
  }
}

impl<K, H> fmt::Debug for KeyGates<K, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyGates")
      .field("num_shards", &self.shards.len())
      .field("len", &self.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::thread;
  use std::time::{Duration, Instant};

  fn gates() -> KeyGates<&'static str> {
    KeyGates::new(4, ahash::RandomState::new())
  }

  #[test]
  fn test_same_key_shares_one_gate() {
    let gates = gates();
    let a = gates.gate_for(&"a");
    let a_again = gates.gate_for(&"a");
    let b = gates.gate_for(&"b");

    assert!(Arc::ptr_eq(&a, &a_again));
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(gates.len(), 2);
  }

  #[test]
  fn test_fail_fast_on_held_gate() {
    let gate = KeyGate::new();
    let permit = gate.acquire(CircuitBreakerTimeout::FailFast);
    assert!(permit.is_some());
    assert!(gate.is_held());
    assert!(gate.acquire(CircuitBreakerTimeout::FailFast).is_none());

    drop(permit);
    assert!(!gate.is_held());
    assert!(gate.acquire(CircuitBreakerTimeout::FailFast).is_some());
  }

  #[test]
  fn test_bounded_wait_times_out() {
    let gate = KeyGate::new();
    let _permit = gate.acquire(CircuitBreakerTimeout::Forever).unwrap();

    let started = Instant::now();
    let second = gate.acquire(CircuitBreakerTimeout::After(Duration::from_millis(50)));
    assert!(second.is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
  }

  #[test]
  fn test_forever_waits_for_release() {
    let gate = Arc::new(KeyGate::new());
    let (tx, rx) = mpsc::channel();

    let holder = {
      let gate = gate.clone();
      thread::spawn(move || {
        let _permit = gate.acquire(CircuitBreakerTimeout::Forever).unwrap();
        tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
      })
    };

    rx.recv().unwrap();
    let started = Instant::now();
    assert!(gate.acquire(CircuitBreakerTimeout::Forever).is_some());
    assert!(started.elapsed() >= Duration::from_millis(50));
    holder.join().unwrap();
  }

  #[test]
  fn test_clear_releases_all_gates() {
    let gates = gates();
    let held = gates.gate_for(&"x");
    gates.gate_for(&"y");

    assert_eq!(gates.clear(), 2);
    assert_eq!(gates.len(), 0);

    let fresh = gates.gate_for(&"x");
    assert!(!Arc::ptr_eq(&held, &fresh));
  }

  #[test]
  fn test_retain_drops_only_rejected_gates() {
    let gates = gates();
    let held = gates.gate_for(&"gone");
    gates.gate_for(&"kept");
    gates.gate_for(&"also-gone");

    assert_eq!(gates.retain(|key| *key == "kept"), 2);
    assert_eq!(gates.len(), 1);
    assert_eq!(gates.retain(|key| *key == "kept"), 0);

    // A caller still holding a dropped gate keeps a working one.
    assert!(held.acquire(CircuitBreakerTimeout::FailFast).is_some());
    assert!(!Arc::ptr_eq(&held, &gates.gate_for(&"gone")));
  }

  #[test]
  fn test_debug_reports_gate_count() {
    let gates = gates();
    gates.gate_for(&"a");
    gates.gate_for(&"b");

    let printed = format!("{gates:?}");
    assert!(printed.contains("num_shards: 4"), "{printed}");
    assert!(printed.contains("len: 2"), "{printed}");
  }

  #[cfg(feature = "tokio")]
  #[tokio::test]
  async fn test_async_fail_fast_on_held_gate() {
    let gate = KeyGate::new();
    let permit = gate.acquire(CircuitBreakerTimeout::FailFast);
    assert!(permit.is_some());
    assert!(gate.acquire_async(CircuitBreakerTimeout::FailFast).await.is_none());

    drop(permit);
    assert!(gate.acquire_async(CircuitBreakerTimeout::FailFast).await.is_some());
  }

  #[cfg(feature = "tokio")]
  #[tokio::test]
  async fn test_async_bounded_wait_times_out() {
    let gate = KeyGate::new();
    let _permit = gate.acquire(CircuitBreakerTimeout::Forever).unwrap();

    let started = Instant::now();
    let second = gate
      .acquire_async(CircuitBreakerTimeout::After(Duration::from_millis(50)))
      .await;
    assert!(second.is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
  }

  #[cfg(feature = "tokio")]
  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_async_waiter_wakes_when_thread_releases() {
    let gate = Arc::new(KeyGate::new());
    let (tx, rx) = mpsc::channel();

    let holder = {
      let gate = gate.clone();
      thread::spawn(move || {
        let _permit = gate.acquire(CircuitBreakerTimeout::Forever).unwrap();
        tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
      })
    };

    rx.recv().unwrap();
    let started = Instant::now();
    let permit = gate
      .acquire_async(CircuitBreakerTimeout::After(Duration::from_secs(5)))
      .await;
    assert!(permit.is_some());
    assert!(started.elapsed() >= Duration::from_millis(50));
    drop(permit);
    holder.join().unwrap();
  }
}
