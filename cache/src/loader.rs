use crate::error::LoaderError;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The default loader of a cache, shared by every caller.
///
/// Loaders run on the calling thread while it holds the key's gate, so a
/// given key is never loaded by two callers at once.
pub(crate) type Loader<K, V> = Arc<dyn Fn(&K) -> Result<V, LoaderError> + Send + Sync>;

pub(crate) type LoadFuture<V> = Pin<Box<dyn Future<Output = Result<V, LoaderError>> + Send>>;

/// The default loader of an [`AsyncCache`](crate::handles::AsyncCache). It is
/// awaited by the task holding the key's gate.
pub(crate) type AsyncLoader<K, V> = Arc<dyn Fn(K) -> LoadFuture<V> + Send + Sync>;

/// Wraps a loader with any error type convertible into [`LoaderError`].
pub(crate) fn boxed<K, V, E, F>(f: F) -> Loader<K, V>
where
  F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
  E: Into<LoaderError> + 'static,
  K: 'static,
  V: 'static,
{
  Arc::new(move |key: &K| f(key).map_err(Into::into))
}

#[cfg(feature = "tokio")]
pub(crate) fn boxed_async<K, V, E, F, Fut>(f: F) -> AsyncLoader<K, V>
where
  F: Fn(K) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<V, E>> + Send + 'static,
  E: Into<LoaderError> + 'static,
  K: 'static,
  V: 'static,
{
  Arc::new(move |key: K| -> LoadFuture<V> {
    let load = f(key);
    Box::pin(async move { load.await.map_err(Into::into) })
  })
}
