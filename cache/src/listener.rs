use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::generation::{Generation, GenerationKey};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Observability hooks for a cache.
///
/// Callbacks run synchronously on the thread that triggered them: `on_hit`
/// and `on_miss` on the reading thread, `on_flush` on whichever thread ran the
/// flush pass. A callback that panics is caught and ignored so a faulty
/// observer cannot break the cache.
pub trait CacheListener<K, V>: Send + Sync {
  /// A fresh entry was served.
  fn on_hit(&self, _key: &K, _entry: &CacheEntry<V>) {}

  /// The loader ran and its value was stored.
  fn on_miss(&self, _key: &K, _entry: &CacheEntry<V>, _load_duration: Duration) {}

  /// A flush pass finished. Called once per distinct client context of the
  /// entries present before or after the pass, with that context's entry
  /// counts and an even share of the pass time. `context` is `None` for
  /// entries without one, and for a pass over an empty cache.
  fn on_flush(
    &self,
    _context: Option<&str>,
    _remaining: usize,
    _evicted: usize,
    _duration: Duration,
  ) {
  }
}

/// Hooks for the refresh cycles of a
/// [`SelfRefreshingCache`](crate::SelfRefreshingCache). Panics are caught
/// and ignored, as with [`CacheListener`].
pub trait RefreshListener: Send + Sync {
  /// A cycle completed and `generation` is now current. Called once per
  /// distinct client context in that generation, or once with `None` if it
  /// is empty.
  fn on_refresh(&self, _generation: Generation, _context: Option<&str>, _duration: Duration) {}

  /// A cycle was aborted; `generation` is still current.
  fn on_refresh_failed(&self, _generation: Generation, _duration: Duration, _error: &CacheError) {}
}

/// Values that hold resources which should be released when the cache drops them.
pub trait Disposable {
  fn dispose(&self);
}

/// Releases a value's resources. Called only when `dispose_expired_values`
/// is enabled, and only for values that were invalidated or evicted.
pub(crate) type Disposer<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Runs a user callback, swallowing any panic it raises.
pub(crate) fn guarded<F: FnOnce()>(cache_name: &str, callback: &'static str, f: F) {
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
    tracing::warn!(
      cache = %cache_name,
      callback,
      panic = %panic_message(payload.as_ref()),
      "cache callback panicked; ignoring"
    );
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

/// Presents a listener of user keys to the generation cache, which is keyed
/// by `(key, generation)`.
pub(crate) struct GenerationListener<K, V> {
  pub(crate) inner: Arc<dyn CacheListener<K, V>>,
}

impl<K, V> CacheListener<GenerationKey<K>, V> for GenerationListener<K, V> {
  fn on_hit(&self, key: &GenerationKey<K>, entry: &CacheEntry<V>) {
    self.inner.on_hit(&key.key, entry);
  }

  fn on_miss(&self, key: &GenerationKey<K>, entry: &CacheEntry<V>, load_duration: Duration) {
    self.inner.on_miss(&key.key, entry, load_duration);
  }

  fn on_flush(&self, context: Option<&str>, remaining: usize, evicted: usize, duration: Duration) {
    self.inner.on_flush(context, remaining, evicted, duration);
  }
}
