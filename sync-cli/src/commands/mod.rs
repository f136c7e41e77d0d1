//! CLI command implementations.

pub mod needs_download;
pub mod objects;
pub mod status;
pub mod trackers;

use objsync_client::{Repository, SqliteStore};
use std::sync::Arc;

/// Typed access over an opened store.
pub(crate) fn repository(store: &SqliteStore) -> Repository {
    Repository::new(Arc::new(store.clone()))
}
