//! This module contains the background tasks for the caches: the janitor
//! that runs the flush pass and the refresher that rotates generations.

pub(crate) mod janitor;
pub(crate) mod refresher;
