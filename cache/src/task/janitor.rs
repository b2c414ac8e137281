use crate::error::BuildError;
use crate::listener::{self, CacheListener};
use crate::metrics::Metrics;
use crate::shared::CacheShared;
use crate::sync::StopSignal;
use crate::time;

use std::collections::BTreeMap;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The result of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
  /// Stale entries removed.
  pub expired: usize,
  /// Fresh entries removed to get back under the size indicator.
  pub trimmed: usize,
  /// Entries left in the store after the pass.
  pub remaining: usize,
}

impl FlushOutcome {
  pub fn evicted(&self) -> usize {
    self.expired + self.trimmed
  }
}

/// The background thread that runs the flush pass on the flush interval.
///
/// It holds only a weak reference to the cache, so an abandoned cache is
/// dropped normally and the thread exits on its next tick.
pub(crate) struct Janitor {
  handle: Option<JoinHandle<()>>,
  stop: Arc<StopSignal>,
}

impl Janitor {
  /// Spawns a new janitor thread.
  pub(crate) fn spawn<K, V>(shared: &Arc<CacheShared<K, V>>) -> Result<Self, BuildError>
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    let stop = Arc::new(StopSignal::new());
    let stop_clone = stop.clone();
    let weak: Weak<CacheShared<K, V>> = Arc::downgrade(shared);
    let interval = shared.options.flush_interval;

    let handle = thread::Builder::new()
      .name(format!("{}-janitor", shared.name()))
      .spawn(move || {
        // The next pass is scheduled only once the current one has finished.
        while !stop_clone.wait_timeout(interval) {
          let Some(shared) = weak.upgrade() else {
            break;
          };
          let result = panic::catch_unwind(AssertUnwindSafe(|| flush_invalidated_entries(&shared)));
          if let Err(payload) = result {
            tracing::warn!(
              cache = %shared.name(),
              panic = %listener::panic_message(payload.as_ref()),
              "flush pass panicked; retrying on the next tick"
            );
          }
        }
      })
      .map_err(|e| BuildError::Spawn {
        task: "janitor",
        reason: e.to_string(),
      })?;

    Ok(Self {
      handle: Some(handle),
      stop,
    })
  }

  /// Signals the janitor thread to stop and waits for it to exit.
  ///
  /// When called from the janitor thread itself (the cache was dropped while
  /// a pass held the last reference) it only signals.
  pub(crate) fn stop(mut self) {
    self.stop.stop();
    if let Some(handle) = self.handle.take() {
      if handle.thread().id() != thread::current().id() {
        let _ = handle.join();
      }
    }
  }
}

/// Runs one flush pass: drops stale entries, then trims the oldest entries
/// until the store is back at `maximum_cache_size_indicator`.
pub(crate) fn flush_invalidated_entries<K, V>(shared: &CacheShared<K, V>) -> FlushOutcome
where
  K: Eq + Hash + Clone,
{
  let _pass = shared.flush_lock.lock();
  let started = Instant::now();
  let now = time::now_nanos();
  let before = shared.listener.as_ref().map(|_| count_by_context(shared));

  // Phase 1: expiry.
  let mut expired = 0;
  let mut survivors = Vec::new();
  for (key, entry) in shared.store.iter() {
    if !entry.is_stale_at(now) {
      survivors.push((key, entry));
      continue;
    }
    if shared.remove_exact(&key, &entry) {
      expired += 1;
    } else if let Some(current) = shared.store.try_get(&key) {
      // Reloaded since it was read; keep the newer entry as a trim candidate.
      survivors.push((key, current));
    }
  }

  // Phase 2: size trim, oldest load first, least recently accessed on ties.
  let mut trimmed = 0;
  let limit = shared.options.maximum_cache_size_indicator;
  let len = shared.store.len();
  if len > limit {
    survivors.sort_by_cached_key(|(_, entry)| (entry.loaded_nanos(), entry.accessed_nanos()));
    let mut excess = len - limit;
    for (key, entry) in &survivors {
      if excess == 0 {
        break;
      }
      if shared.remove_exact(key, entry) {
        trimmed += 1;
        excess -= 1;
      }
    }
  }

  let remaining = shared.store.len();
  let elapsed = started.elapsed();
  Metrics::incr(&shared.metrics.flush_passes);
  Metrics::add(&shared.metrics.evicted_expired, expired as u64);
  Metrics::add(&shared.metrics.evicted_capacity, trimmed as u64);

  tracing::trace!(
    cache = %shared.name(),
    expired,
    trimmed,
    remaining,
    elapsed = ?elapsed,
    "flush pass complete"
  );

  if let (Some(listener), Some(before)) = (&shared.listener, before) {
    report_flush(shared, listener.as_ref(), before, elapsed);
  }

  FlushOutcome {
    expired,
    trimmed,
    remaining,
  }
}

fn count_by_context<K, V>(shared: &CacheShared<K, V>) -> BTreeMap<Option<String>, usize> {
  let mut counts = BTreeMap::new();
  for (_, entry) in shared.store.iter() {
    *counts.entry(entry.client_context()).or_insert(0) += 1;
  }
  counts
}

/// Calls `on_flush` once per distinct client context seen before or after
/// the pass, splitting the pass time evenly between them. An empty cache is
/// reported once, without a context.
fn report_flush<K, V>(
  shared: &CacheShared<K, V>,
  listener: &dyn CacheListener<K, V>,
  before: BTreeMap<Option<String>, usize>,
  elapsed: Duration,
) where
  K: Eq + Hash + Clone,
{
  let mut contexts: BTreeMap<Option<String>, (usize, usize)> = BTreeMap::new();
  for (context, count) in before {
    contexts.entry(context).or_default().0 = count;
  }
  for (context, count) in count_by_context(shared) {
    contexts.entry(context).or_default().1 = count;
  }
  if contexts.is_empty() {
    contexts.insert(None, (0, 0));
  }

  let share = elapsed / contexts.len() as u32;
  for (context, (before, remaining)) in &contexts {
    let evicted = before.saturating_sub(*remaining);
    listener::guarded(shared.name(), "on_flush", || {
      listener.on_flush(context.as_deref(), *remaining, evicted, share)
    });
  }
}
