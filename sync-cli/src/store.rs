//! Opening the store read-only.

use anyhow::{bail, Context, Result};
use objsync_client::SqliteStore;
use std::path::Path;

/// File name of the store inside the data directory.
pub const DEFAULT_DB: &str = "objsync.db";

/// Open an existing store without write access.
pub async fn open(path: &Path) -> Result<SqliteStore> {
    if !path.exists() {
        bail!("No store at {}. Pass --db to point at one.", path.display());
    }
    tracing::debug!("Opening {} read-only", path.display());
    SqliteStore::open_read_only(path)
        .await
        .with_context(|| format!("Failed to open store at {}", path.display()))
}

/// Print a report as pretty JSON.
pub fn print_json<T: serde::Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_store_is_an_error() {
        let dir = tempdir().unwrap();
        let err = open(&dir.path().join(DEFAULT_DB)).await.unwrap_err();
        assert!(err.to_string().contains("No store"));
    }

    #[tokio::test]
    async fn opens_existing_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_DB);
        SqliteStore::open(&path).await.unwrap();

        assert!(open(&path).await.is_ok());
    }
}
