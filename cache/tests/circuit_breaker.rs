use warmcache::{Cache, CacheBuilder, CacheError, CircuitBreakerTimeout};

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  mpsc, Arc, Barrier,
};
use std::thread;
use std::time::{Duration, Instant};

fn slow_cache(
  name: &str,
  timeout: impl Into<CircuitBreakerTimeout>,
  load_time: Duration,
  load_count: &Arc<AtomicUsize>,
) -> Arc<Cache<&'static str, u64>> {
  let load_count = load_count.clone();
  Arc::new(
    CacheBuilder::new(name)
      .circuit_breaker_timeout(timeout)
      .loader(move |_: &&'static str| {
        thread::sleep(load_time);
        Ok::<_, std::io::Error>(load_count.fetch_add(1, Ordering::SeqCst) as u64)
      })
      .build()
      .unwrap(),
  )
}

/// Starts a load of `key` on another thread and returns once it holds the gate.
fn start_load(cache: &Arc<Cache<&'static str, u64>>, key: &'static str) -> thread::JoinHandle<u64> {
  let (tx, rx) = mpsc::channel();
  let cache = cache.clone();
  let handle = thread::spawn(move || {
    let value = cache
      .get_or_load_with(&key, |_| {
        tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(300));
        Ok::<_, std::io::Error>(42)
      })
      .unwrap();
    *value
  });
  rx.recv().unwrap();
  handle
}

#[test]
fn test_fail_fast_rejects_waiters_immediately() {
  let loads = Arc::new(AtomicUsize::new(0));
  let cache = slow_cache("fail-fast", Duration::ZERO, Duration::from_millis(10), &loads);
  assert_eq!(
    cache.options().circuit_breaker_timeout,
    CircuitBreakerTimeout::FailFast
  );

  let loader = start_load(&cache, "busy");

  let started = Instant::now();
  let err = cache.get_or_load(&"busy").unwrap_err();
  assert!(err.is_circuit_breaker_timeout());
  assert!(started.elapsed() < Duration::from_millis(200), "fail fast must not wait");

  // The in-flight load is not disturbed by the rejected caller.
  assert_eq!(loader.join().unwrap(), 42);
  assert_eq!(*cache.get_or_load(&"busy").unwrap(), 42);
  assert_eq!(loads.load(Ordering::SeqCst), 0, "default loader never ran");
  assert_eq!(cache.metrics().circuit_breaker_timeouts, 1);
}

#[test]
fn test_bounded_wait_times_out() {
  let loads = Arc::new(AtomicUsize::new(0));
  let cache = slow_cache(
    "bounded",
    CircuitBreakerTimeout::After(Duration::from_millis(50)),
    Duration::from_millis(10),
    &loads,
  );

  let loader = start_load(&cache, "busy");

  let started = Instant::now();
  let err = cache.get_or_load(&"busy").unwrap_err();
  let waited = started.elapsed();
  assert!(waited >= Duration::from_millis(50), "waited only {waited:?}");
  assert!(waited < Duration::from_millis(300), "waited {waited:?}");

  match err {
    CacheError::CircuitBreakerTimeout { cache: name, key, timeout } => {
      assert_eq!(name, "bounded");
      assert_eq!(key, "\"busy\"");
      assert_eq!(timeout, CircuitBreakerTimeout::After(Duration::from_millis(50)));
    }
    other => panic!("expected a circuit breaker timeout, got {other:?}"),
  }

  assert_eq!(loader.join().unwrap(), 42);
}

#[test]
fn test_bounded_wait_succeeds_when_load_finishes_in_time() {
  let loads = Arc::new(AtomicUsize::new(0));
  let cache = slow_cache(
    "patient",
    Duration::from_millis(2000),
    Duration::from_millis(10),
    &loads,
  );

  let loader = start_load(&cache, "busy");
  // The holder finishes within the timeout; the waiter reads its value.
  assert_eq!(*cache.get_or_load(&"busy").unwrap(), 42);
  assert_eq!(loader.join().unwrap(), 42);
  assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_forever_waits_for_slow_loads() {
  let loads = Arc::new(AtomicUsize::new(0));
  let cache = slow_cache("forever", Duration::MAX, Duration::from_millis(10), &loads);
  assert_eq!(
    cache.options().circuit_breaker_timeout,
    CircuitBreakerTimeout::Forever
  );

  let loader = start_load(&cache, "busy");
  assert_eq!(*cache.get_or_load(&"busy").unwrap(), 42);
  assert_eq!(loader.join().unwrap(), 42);
}

#[test]
fn test_parallel_callers_on_a_slow_key() {
  let loads = Arc::new(AtomicUsize::new(0));
  let cache = slow_cache(
    "parallel",
    CircuitBreakerTimeout::After(Duration::from_millis(20)),
    Duration::from_millis(250),
    &loads,
  );
  let num_threads = 15;
  let barrier = Arc::new(Barrier::new(num_threads));
  let timeouts = Arc::new(AtomicUsize::new(0));

  let handles: Vec<_> = (0..num_threads)
    .map(|_| {
      let cache = cache.clone();
      let barrier = barrier.clone();
      let timeouts = timeouts.clone();
      thread::spawn(move || {
        barrier.wait();
        for _ in 0..5 {
          match cache.get_or_load(&"slow") {
            Ok(value) => assert_eq!(*value, 0),
            Err(e) if e.is_circuit_breaker_timeout() => {
              timeouts.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => panic!("unexpected error: {e}"),
          }
        }
      })
    })
    .collect();

  for handle in handles {
    handle.join().unwrap();
  }

  // One caller loaded; everyone else either timed out or read its value.
  assert_eq!(loads.load(Ordering::SeqCst), 1);
  assert!(timeouts.load(Ordering::SeqCst) >= 1);
  assert_eq!(
    cache.metrics().circuit_breaker_timeouts,
    timeouts.load(Ordering::SeqCst) as u64
  );
}
