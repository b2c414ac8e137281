#![allow(dead_code)]

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use warmcache::{Cache, CacheBuilder};

// A custom hasher that allows us to control which shard a key is assigned to.
// It simply uses the integer value of the key as its hash.
// For a 4-shard store:
// - key 0 -> shard 0 (0 % 4 = 0)
// - key 1 -> shard 1 (1 % 4 = 1)
// - key 4 -> shard 0 (4 % 4 = 0)
#[derive(Clone, Default)]
pub struct ShardControllingHasher;
impl BuildHasher for ShardControllingHasher {
  type Hasher = TestHasher;
  fn build_hasher(&self) -> Self::Hasher {
    TestHasher(0)
  }
}
pub struct TestHasher(u64);
impl Hasher for TestHasher {
  fn finish(&self) -> u64 {
    self.0
  }
  fn write(&mut self, _: &[u8]) {
    unimplemented!()
  }
  fn write_i32(&mut self, i: i32) {
    self.0 = i as u64;
  }
}

/// A loader that renders the key and counts its invocations.
pub fn counting_loader(
  counter: &Arc<AtomicUsize>,
) -> impl Fn(&i32) -> Result<String, std::io::Error> + Send + Sync + 'static {
  let counter = counter.clone();
  move |key: &i32| {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(key.to_string())
  }
}

/// A cache whose janitor effectively never runs, so tests drive flush passes
/// themselves.
pub fn manual_flush_cache(max: usize, expiry: Duration) -> Cache<i32, String> {
  CacheBuilder::new("manual")
    .maximum_cache_size_indicator(max)
    .cache_item_expiry(expiry)
    .cache_item_expiry_jitter_percent(0)
    .flush_interval(Duration::from_secs(3600))
    .build()
    .unwrap()
}

/// Sleeps until `elapsed` has passed since `start`.
pub fn sleep_until(start: Instant, elapsed: Duration) {
  if let Some(remaining) = elapsed.checked_sub(start.elapsed()) {
    thread::sleep(remaining);
  }
}
