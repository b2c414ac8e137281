use warmcache::{CacheBuilder, CacheEntry, CacheListener};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Recorded {
  hits: AtomicUsize,
  misses: AtomicUsize,
  flushes: Mutex<Vec<(Option<String>, usize, usize)>>,
  contexts: Mutex<Vec<Option<String>>>,
}

struct RecordingListener(Arc<Recorded>);

impl CacheListener<i32, String> for RecordingListener {
  fn on_hit(&self, _key: &i32, entry: &CacheEntry<String>) {
    self.0.hits.fetch_add(1, Ordering::SeqCst);
    self.0.contexts.lock().unwrap().push(entry.client_context());
  }

  fn on_miss(&self, key: &i32, entry: &CacheEntry<String>, _load_duration: Duration) {
    self.0.misses.fetch_add(1, Ordering::SeqCst);
    let parity = if key % 2 == 0 { "even" } else { "odd" };
    entry.set_client_context(parity);
  }

  fn on_flush(&self, context: Option<&str>, remaining: usize, evicted: usize, _duration: Duration) {
    self
      .0
      .flushes
      .lock()
      .unwrap()
      .push((context.map(str::to_string), remaining, evicted));
  }
}

fn recording_cache(max: usize) -> (warmcache::Cache<i32, String>, Arc<Recorded>) {
  let recorded = Arc::new(Recorded::default());
  let cache = CacheBuilder::new("listened")
    .maximum_cache_size_indicator(max)
    .flush_interval(Duration::from_secs(3600))
    .loader(|key: &i32| Ok::<_, std::io::Error>(key.to_string()))
    .listener(RecordingListener(recorded.clone()))
    .build()
    .unwrap();
  (cache, recorded)
}

#[test]
fn test_hit_and_miss_callbacks() {
  let (cache, recorded) = recording_cache(100);

  cache.get_or_load(&1).unwrap();
  cache.get_or_load(&1).unwrap();
  cache.get_or_load(&1).unwrap();
  cache.get_or_load(&2).unwrap();

  assert_eq!(recorded.misses.load(Ordering::SeqCst), 2);
  assert_eq!(recorded.hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_plain_get_miss_does_not_fire_on_miss() {
  let (cache, recorded) = recording_cache(100);
  assert!(cache.get(&1).is_none());
  // on_miss reports loads, and nothing was loaded.
  assert_eq!(recorded.misses.load(Ordering::SeqCst), 0);
  assert_eq!(cache.metrics().misses, 1);
}

#[test]
fn test_client_context_set_on_miss_is_visible_on_hit() {
  let (cache, recorded) = recording_cache(100);

  cache.get_or_load(&3).unwrap();
  cache.get_or_load(&4).unwrap();
  cache.get(&3).unwrap();
  cache.get(&4).unwrap();

  let contexts = recorded.contexts.lock().unwrap().clone();
  assert_eq!(
    contexts,
    vec![Some("odd".to_string()), Some("even".to_string())]
  );
}

fn flush(context: &str, remaining: usize, evicted: usize) -> (Option<String>, usize, usize) {
  (Some(context.to_string()), remaining, evicted)
}

#[test]
fn test_on_flush_reports_each_client_context() {
  let (cache, recorded) = recording_cache(4);
  for key in 0..10 {
    cache.get_or_load(&key).unwrap();
    thread::sleep(Duration::from_millis(1));
  }

  // Trimming keeps the four newest loads: 6 and 8 are even, 7 and 9 odd.
  let outcome = cache.flush_invalidated_entries();
  assert_eq!(outcome.remaining, 4);
  assert_eq!(outcome.evicted(), 6);
  assert_eq!(
    *recorded.flushes.lock().unwrap(),
    vec![flush("even", 2, 3), flush("odd", 2, 3)]
  );

  recorded.flushes.lock().unwrap().clear();
  cache.flush_invalidated_entries();
  assert_eq!(
    *recorded.flushes.lock().unwrap(),
    vec![flush("even", 2, 0), flush("odd", 2, 0)]
  );
}

#[test]
fn test_on_flush_groups_entries_without_context() {
  let (cache, recorded) = recording_cache(100);
  cache.try_add(1, "one".to_string());
  cache.try_add(2, "two".to_string());
  cache.get_or_load(&3).unwrap();

  cache.flush_invalidated_entries();
  assert_eq!(
    *recorded.flushes.lock().unwrap(),
    vec![(None, 2, 0), flush("odd", 1, 0)]
  );
}

#[test]
fn test_on_flush_of_empty_cache_reports_once() {
  let (cache, recorded) = recording_cache(100);
  cache.flush_invalidated_entries();
  assert_eq!(*recorded.flushes.lock().unwrap(), vec![(None, 0, 0)]);
}

struct PanickingListener;

impl CacheListener<i32, String> for PanickingListener {
  fn on_hit(&self, _key: &i32, _entry: &CacheEntry<String>) {
    panic!("listener bug on hit");
  }

  fn on_miss(&self, _key: &i32, _entry: &CacheEntry<String>, _load_duration: Duration) {
    panic!("listener bug on miss");
  }

  fn on_flush(&self, _context: Option<&str>, _remaining: usize, _evicted: usize, _duration: Duration) {
    panic!("listener bug on flush");
  }
}

#[test]
fn test_panicking_listener_does_not_break_the_cache() {
  let cache = CacheBuilder::new("panicky")
    .flush_interval(Duration::from_secs(3600))
    .loader(|key: &i32| Ok::<_, std::io::Error>(key.to_string()))
    .listener(PanickingListener)
    .build()
    .unwrap();

  assert_eq!(cache.get_or_load(&1).unwrap().as_str(), "1");
  assert_eq!(cache.get_or_load(&1).unwrap().as_str(), "1");
  assert_eq!(cache.get(&1).as_deref().map(String::as_str), Some("1"));

  let outcome = cache.flush_invalidated_entries();
  assert_eq!(outcome.remaining, 1);
  assert_eq!(cache.metrics().loads, 1);
}
