//! A concurrent, in-process cache that sits in front of a slow or expensive
//! loader.
//!
//! # Features
//! - **Single-flight loading**: concurrent misses on one key run the loader
//!   once; the other callers wait, bounded by a circuit breaker timeout.
//! - **Expiry with jitter**: each entry gets a time-to-live spread around the
//!   configured expiry so entries loaded together do not expire together.
//! - **Size trimming**: a background flush pass removes stale entries and
//!   trims the oldest ones until the cache is back at its size indicator.
//! - **Self-refreshing variant**: [`SelfRefreshingCache`] reloads its hot
//!   entries into the next generation on a timer and swaps it in atomically.
//! - **Async loading**: with the `tokio` feature, [`AsyncCache`] awaits its
//!   loader and its key gates without blocking the runtime.
//! - **Observability**: listener callbacks and a metrics snapshot.
//! - **Configuration**: options deserializable with the optional `serde` feature.

// Public modules that form the API
pub mod builder;
pub mod error;
pub mod generation;
pub mod handles;
pub mod iter;
pub mod listener;
pub mod metrics;
pub mod options;
pub mod store;

// Internal, crate-only modules
mod entry;
mod gate;
mod loader;
mod shared;
mod sync;
mod task;
mod time;

// Re-export the primary user-facing types for convenience
pub use builder::{CacheBuilder, SelfRefreshingCacheBuilder};
pub use entry::CacheEntry;
pub use error::{BuildError, CacheError, LoaderError};
pub use generation::{Generation, GenerationKey};
#[cfg(feature = "tokio")]
pub use handles::AsyncCache;
pub use handles::{Cache, SelfRefreshingCache};
pub use listener::{CacheListener, Disposable, RefreshListener};
pub use metrics::MetricsSnapshot;
pub use options::{CacheOptions, CircuitBreakerTimeout, SelfRefreshingCacheOptions};
pub use store::{InMemoryStore, KeyValueStore};
pub use task::janitor::FlushOutcome;
