use crate::error::{BuildError, CacheError};
use crate::generation::{Generation, GenerationKey};
use crate::listener::{self, RefreshListener};
use crate::metrics::Metrics;
use crate::shared::RefreshShared;
use crate::sync::StopSignal;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The background thread that rotates generations on the refresh interval.
pub(crate) struct Refresher {
  handle: Option<JoinHandle<()>>,
  stop: Arc<StopSignal>,
}

impl Refresher {
  pub(crate) fn spawn<K, V>(shared: &Arc<RefreshShared<K, V>>) -> Result<Self, BuildError>
  where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    let stop = Arc::new(StopSignal::new());
    let stop_clone = stop.clone();
    let weak: Weak<RefreshShared<K, V>> = Arc::downgrade(shared);
    let interval = shared.options.refresh_interval;

    let handle = thread::Builder::new()
      .name(format!("{}-refresher", shared.name()))
      .spawn(move || {
        while !stop_clone.wait_timeout(interval) {
          let Some(shared) = weak.upgrade() else {
            break;
          };
          // Failures are reported inside; the timer restarts either way.
          let _ = run_refresh_cycle(&shared);
        }
      })
      .map_err(|e| BuildError::Spawn {
        task: "refresher",
        reason: e.to_string(),
      })?;

    Ok(Self {
      handle: Some(handle),
      stop,
    })
  }

  /// Signals the refresher thread to stop and waits for an in-progress cycle
  /// to finish, unless called from the refresher thread itself.
  pub(crate) fn stop(mut self) {
    self.stop.stop();
    if let Some(handle) = self.handle.take() {
      if handle.thread().id() != thread::current().id() {
        let _ = handle.join();
      }
    }
  }
}

/// Runs one refresh cycle and reports its outcome through metrics, logs and
/// the refresh listener. A panicking cycle is reported as a failure.
pub(crate) fn run_refresh_cycle<K, V>(shared: &RefreshShared<K, V>) -> Result<Generation, CacheError>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  let started = Instant::now();
  let result = panic::catch_unwind(AssertUnwindSafe(|| refresh(shared))).unwrap_or_else(|payload| {
    Err(CacheError::RefreshPanicked(listener::panic_message(
      payload.as_ref(),
    )))
  });
  let elapsed = started.elapsed();
  let metrics = &shared.generations.shared.metrics;

  match &result {
    Ok((generation, migrated)) => {
      Metrics::incr(&metrics.refresh_cycles);
      tracing::debug!(
        cache = %shared.name(),
        generation = %generation,
        migrated,
        elapsed = ?elapsed,
        "refresh cycle complete"
      );
      if let Some(listener) = &shared.listener {
        report_refresh(shared, listener.as_ref(), *generation, elapsed);
      }
    }
    Err(error) => {
      Metrics::incr(&metrics.refresh_failures);
      let generation = shared.current_generation();
      tracing::warn!(
        cache = %shared.name(),
        generation = %generation,
        error = %error,
        elapsed = ?elapsed,
        "refresh cycle failed; current generation kept"
      );
      if let Some(listener) = &shared.listener {
        listener::guarded(shared.name(), "on_refresh_failed", || {
          listener.on_refresh_failed(generation, elapsed, error)
        });
      }
    }
  }

  result.map(|(generation, _)| generation)
}

/// Loads the most recently accessed keys of the current generation into the
/// next one, makes the next generation current and invalidates the rest.
///
/// Returns the new current generation and the number of keys migrated. On
/// error the current generation is left unchanged and whatever was already
/// loaded into the next generation is kept.
fn refresh<K, V>(shared: &RefreshShared<K, V>) -> Result<(Generation, usize), CacheError>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  let _cycle = shared.cycle_lock.lock();
  let cache = &shared.generations;
  let current = shared.current_generation();
  let next = current.next();

  let mut candidates: Vec<(K, u64)> = cache
    .shared
    .store
    .iter()
    .filter(|(key, _)| key.generation == current)
    .map(|(key, entry)| (key.key, entry.accessed_nanos()))
    .collect();
  candidates.sort_by(|a, b| b.1.cmp(&a.1));
  candidates.truncate(shared.options.cache.maximum_cache_size_indicator);

  let migrated = candidates.len();
  for (key, _) in candidates {
    cache.get_or_load(&GenerationKey::new(key, next))?;
  }

  shared.swap_generation(next);

  // Anything outside the new current and next generation is garbage, which
  // includes the previous generation and late writes to even older ones.
  let upcoming = next.next();
  let garbage: Vec<GenerationKey<K>> = cache
    .shared
    .store
    .iter()
    .map(|(key, _)| key)
    .filter(|key| key.generation != next && key.generation != upcoming)
    .collect();
  for key in &garbage {
    cache.shared.invalidate(key);
  }
  // Gates of dead generations would otherwise pile up, one set per cycle.
  let dropped_gates = cache
    .shared
    .gates
    .retain(|key| key.generation == next || key.generation == upcoming);
  tracing::trace!(
    cache = %shared.name(),
    invalidated = garbage.len(),
    dropped_gates,
    "old generations released"
  );

  Ok((next, migrated))
}

/// Calls `on_refresh` once per distinct client context among the entries of
/// the new current generation, splitting the cycle time evenly between them.
/// An empty generation is reported once, without a context.
fn report_refresh<K, V>(
  shared: &RefreshShared<K, V>,
  listener: &dyn RefreshListener,
  generation: Generation,
  elapsed: Duration,
) where
  K: Eq + Hash + Clone,
{
  let mut contexts: BTreeSet<Option<String>> = shared
    .generations
    .shared
    .store
    .iter()
    .filter(|(key, _)| key.generation == generation)
    .map(|(_, entry)| entry.client_context())
    .collect();
  if contexts.is_empty() {
    contexts.insert(None);
  }

  let share = elapsed / contexts.len() as u32;
  for context in &contexts {
    listener::guarded(shared.name(), "on_refresh", || {
      listener.on_refresh(generation, context.as_deref(), share)
    });
  }
}
