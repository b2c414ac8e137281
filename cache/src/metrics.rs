use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for the cache.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Hit/Miss Ratios ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Loads ---
  pub(crate) loads: CachePadded<AtomicU64>,
  pub(crate) load_failures: CachePadded<AtomicU64>,
  pub(crate) circuit_breaker_timeouts: CachePadded<AtomicU64>,

  // --- Throughput ---
  pub(crate) inserts: CachePadded<AtomicU64>,
  pub(crate) invalidations: CachePadded<AtomicU64>,

  // --- Flush Stats ---
  pub(crate) flush_passes: CachePadded<AtomicU64>,
  pub(crate) evicted_expired: CachePadded<AtomicU64>,
  pub(crate) evicted_capacity: CachePadded<AtomicU64>,

  // --- Generational refresh ---
  pub(crate) refresh_cycles: CachePadded<AtomicU64>,
  pub(crate) refresh_failures: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      loads: CachePadded::new(AtomicU64::new(0)),
      load_failures: CachePadded::new(AtomicU64::new(0)),
      circuit_breaker_timeouts: CachePadded::new(AtomicU64::new(0)),
      inserts: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      flush_passes: CachePadded::new(AtomicU64::new(0)),
      evicted_expired: CachePadded::new(AtomicU64::new(0)),
      evicted_capacity: CachePadded::new(AtomicU64::new(0)),
      refresh_cycles: CachePadded::new(AtomicU64::new(0)),
      refresh_failures: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      loads: self.loads.load(Ordering::Relaxed),
      load_failures: self.load_failures.load(Ordering::Relaxed),
      circuit_breaker_timeouts: self.circuit_breaker_timeouts.load(Ordering::Relaxed),
      inserts: self.inserts.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      flush_passes: self.flush_passes.load(Ordering::Relaxed),
      evicted_expired: self.evicted_expired.load(Ordering::Relaxed),
      evicted_capacity: self.evicted_capacity.load(Ordering::Relaxed),
      refresh_cycles: self.refresh_cycles.load(Ordering::Relaxed),
      refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Reads answered from the cache.
  pub hits: u64,
  /// Reads that found nothing fresh (for `get_or_load`, reads that ran the loader).
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// Successful loader invocations.
  pub loads: u64,
  /// Loader invocations that returned an error.
  pub load_failures: u64,
  /// Callers turned away because a key stayed busy past the circuit breaker timeout.
  pub circuit_breaker_timeouts: u64,
  /// Entries stored through `try_add`.
  pub inserts: u64,
  /// Entries removed through `invalidate`/`invalidate_all`.
  pub invalidations: u64,
  pub flush_passes: u64,
  /// Entries removed by a flush pass because they were stale.
  pub evicted_expired: u64,
  /// Entries removed by a flush pass to get back under the size indicator.
  pub evicted_capacity: u64,
  /// Completed refresh cycles (self-refreshing caches only).
  pub refresh_cycles: u64,
  /// Aborted refresh cycles (self-refreshing caches only).
  pub refresh_failures: u64,
  /// The number of seconds the cache has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("loads", &self.loads)
      .field("load_failures", &self.load_failures)
      .field("circuit_breaker_timeouts", &self.circuit_breaker_timeouts)
      .field("inserts", &self.inserts)
      .field("invalidations", &self.invalidations)
      .field("flush_passes", &self.flush_passes)
      .field("evicted_expired", &self.evicted_expired)
      .field("evicted_capacity", &self.evicted_capacity)
      .field("refresh_cycles", &self.refresh_cycles)
      .field("refresh_failures", &self.refresh_failures)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
