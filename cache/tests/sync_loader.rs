mod common;

use common::counting_loader;
use warmcache::{CacheBuilder, CacheError, CircuitBreakerTimeout};

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc, Barrier,
};
use std::thread;
use std::time::Duration;

#[test]
fn test_sync_loader_basic() {
  // A counter to see how many times the loader is called.
  let load_count = Arc::new(AtomicUsize::new(0));

  let cache = CacheBuilder::new("basic")
    .loader({
      let load_count = load_count.clone();
      move |key: &i32| {
        load_count.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>(key * 10)
      }
    })
    .build()
    .unwrap();

  // 1. First call on a missing key runs the loader.
  let value = cache.get_or_load(&5).unwrap();
  assert_eq!(*value, 50);
  assert_eq!(load_count.load(Ordering::SeqCst), 1, "Loader should be called once");
  assert_eq!(cache.metrics().misses, 1);
  assert_eq!(cache.metrics().loads, 1);
  assert_eq!(cache.count(), 1);

  // 2. Second call is a hit and does not call the loader.
  let value = cache.get_or_load(&5).unwrap();
  assert_eq!(*value, 50);
  assert_eq!(load_count.load(Ordering::SeqCst), 1, "Loader should NOT be called again");
  assert_eq!(cache.metrics().hits, 1);
}

#[test]
fn test_sync_loader_thundering_herd() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let num_threads = 20;

  let cache = Arc::new(
    CacheBuilder::new("herd")
      .circuit_breaker_timeout(CircuitBreakerTimeout::Forever)
      .loader({
        let load_count = load_count.clone();
        move |key: &i32| {
          // Simulate a slow database call or computation
          thread::sleep(Duration::from_millis(100));
          load_count.fetch_add(1, Ordering::SeqCst);
          Ok::<_, std::io::Error>(key * 10)
        }
      })
      .build()
      .unwrap(),
  );

  let barrier = Arc::new(Barrier::new(num_threads));
  let mut handles = vec![];

  for _ in 0..num_threads {
    let cache_clone = cache.clone();
    let barrier_clone = barrier.clone();
    handles.push(thread::spawn(move || {
      // Wait for all threads to be ready
      barrier_clone.wait();
      // All threads request the same missing key at once
      let value = cache_clone.get_or_load(&99).unwrap();
      assert_eq!(*value, 990);
    }));
  }

  for handle in handles {
    handle.join().unwrap();
  }

  // Despite 20 concurrent requests, the loader ran once.
  assert_eq!(
    load_count.load(Ordering::SeqCst),
    1,
    "Thundering herd protection failed: loader was called more than once"
  );
  assert_eq!(cache.metrics().misses, 1, "There should be only one miss");
  assert_eq!(cache.metrics().hits, (num_threads - 1) as u64);
}

#[test]
fn test_distinct_keys_load_in_parallel() {
  let cache = Arc::new(
    CacheBuilder::new("parallel")
      .circuit_breaker_timeout(CircuitBreakerTimeout::FailFast)
      .loader(|key: &i32| {
        thread::sleep(Duration::from_millis(100));
        Ok::<_, std::io::Error>(*key)
      })
      .build()
      .unwrap(),
  );

  // Gates are per key, so fail-fast callers on different keys never collide.
  let barrier = Arc::new(Barrier::new(8));
  let handles: Vec<_> = (0..8)
    .map(|i| {
      let cache = cache.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        cache.get_or_load(&i).map(|v| *v)
      })
    })
    .collect();

  for (i, handle) in handles.into_iter().enumerate() {
    assert_eq!(handle.join().unwrap().unwrap(), i as i32);
  }
  assert_eq!(cache.count(), 8);
}

#[test]
fn test_loader_error_is_returned_and_not_cached() {
  let attempts = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::new("failing")
    .loader({
      let attempts = attempts.clone();
      move |key: &i32| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
          Err("database unavailable")
        } else {
          Ok(key + 1)
        }
      }
    })
    .build()
    .unwrap();

  let err = cache.get_or_load(&1).unwrap_err();
  assert!(matches!(&err, CacheError::Loader(source) if source.to_string() == "database unavailable"));
  assert!(!cache.has_key(&1), "A failed load must not be cached");
  assert_eq!(cache.count(), 0);
  assert_eq!(cache.metrics().load_failures, 1);

  // The next caller retries the load.
  assert_eq!(*cache.get_or_load(&1).unwrap(), 2);
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_waiter_retries_after_failed_load() {
  let cache = Arc::new(
    CacheBuilder::<i32, i32>::new("retry")
      .circuit_breaker_timeout(CircuitBreakerTimeout::Forever)
      .build()
      .unwrap(),
  );

  let first = {
    let cache = cache.clone();
    thread::spawn(move || {
      cache.get_or_load_with(&7, |_| {
        thread::sleep(Duration::from_millis(150));
        Err::<i32, _>("upstream timeout")
      })
    })
  };

  thread::sleep(Duration::from_millis(30));
  // This caller queues behind the failing load, then runs its own loader.
  let second = cache.get_or_load_with(&7, |_| Ok::<_, std::io::Error>(70));

  assert!(matches!(first.join().unwrap(), Err(CacheError::Loader(_))));
  assert_eq!(*second.unwrap(), 70);
  assert_eq!(cache.get(&7).as_deref(), Some(&70));
}

#[test]
fn test_get_or_load_without_loader_fails() {
  let cache = CacheBuilder::<i32, String>::new("no-loader").build().unwrap();

  let err = cache.get_or_load(&1).unwrap_err();
  assert!(matches!(err, CacheError::NoLoader(ref name) if name == "no-loader"));

  // A per-call loader still works.
  let value = cache
    .get_or_load_with(&1, |key| Ok::<_, std::io::Error>(format!("value-{key}")))
    .unwrap();
  assert_eq!(value.as_str(), "value-1");
}

#[test]
fn test_custom_loader_overrides_default() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::new("override")
    .loader(counting_loader(&load_count))
    .build()
    .unwrap();

  let value = cache
    .get_or_load_with(&3, |_| Ok::<_, std::io::Error>("custom".to_string()))
    .unwrap();
  assert_eq!(value.as_str(), "custom");
  assert_eq!(load_count.load(Ordering::SeqCst), 0);

  // The stored value is now served regardless of which loader is passed.
  assert_eq!(cache.get_or_load(&3).unwrap().as_str(), "custom");
  assert_eq!(load_count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stale_entry_is_reloaded() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::new("stale")
    .cache_item_expiry(Duration::from_millis(100))
    .cache_item_expiry_jitter_percent(0)
    .flush_interval(Duration::from_secs(3600))
    .loader(counting_loader(&load_count))
    .build()
    .unwrap();

  cache.get_or_load(&1).unwrap();
  thread::sleep(Duration::from_millis(150));

  assert!(cache.get(&1).is_none(), "Stale entries read as absent");
  assert!(cache.has_key(&1), "Stale entries stay until the flush pass");

  assert_eq!(cache.get_or_load(&1).unwrap().as_str(), "1");
  assert_eq!(load_count.load(Ordering::SeqCst), 2);
  assert_eq!(cache.count(), 1);
  assert!(cache.get(&1).is_some());
}
