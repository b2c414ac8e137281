#[cfg(feature = "tokio")]
mod futures;
mod refreshing;
mod sync;

#[cfg(feature = "tokio")]
pub use futures::AsyncCache;
pub use refreshing::SelfRefreshingCache;
pub use sync::Cache;
