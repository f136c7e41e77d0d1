//! Show row counts per kind.

use anyhow::Result;
use objsync_client::SqliteStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::store::print_json;

/// What `status` reports.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub rows: BTreeMap<String, i64>,
}

impl StatusReport {
    fn total(&self) -> i64 {
        self.rows.values().sum()
    }
}

/// Gather the report.
pub async fn report(store: &SqliteStore, db: &Path) -> Result<StatusReport> {
    let rows = store.counts().await?.into_iter().collect();
    Ok(StatusReport {
        database: db.to_path_buf(),
        rows,
    })
}

/// Run the status command.
pub async fn run(store: &SqliteStore, db: &Path, json: bool) -> Result<()> {
    let report = report(store, db).await?;
    if json {
        return print_json(&report);
    }

    println!("=== objsync status ===");
    println!();
    println!("Database: {}", report.database.display());
    println!();
    if report.rows.is_empty() {
        println!("Store is empty.");
        return Ok(());
    }
    for (kind, count) in &report.rows {
        println!("  {:<16} {}", kind, count);
    }
    println!("  {:<16} {}", "total", report.total());
    Ok(())
}
