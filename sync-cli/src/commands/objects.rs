//! List objects and their files.

use anyhow::Result;
use objsync_client::SqliteStore;
use objsync_core::{FileEntry, ObjectEntry};
use serde::Serialize;
use std::collections::BTreeMap;

use super::repository;
use crate::store::print_json;

/// One object with its files.
#[derive(Debug, Serialize)]
pub struct ObjectReport {
    #[serde(flatten)]
    pub object: ObjectEntry,
    pub files: Vec<FileEntry>,
}

/// Gather objects, skipping deleted ones unless asked.
pub async fn report(store: &SqliteStore, include_deleted: bool) -> Result<Vec<ObjectReport>> {
    let repo = repository(store);
    let objects = repo.all::<ObjectEntry>().await?;
    let mut files: BTreeMap<_, Vec<FileEntry>> = BTreeMap::new();
    for file in repo.all::<FileEntry>().await? {
        files.entry(file.group_id).or_default().push(file);
    }

    let mut report: Vec<ObjectReport> = objects
        .into_iter()
        .filter(|o| include_deleted || !o.is_deleted())
        .map(|object| {
            let mut files = files.remove(&object.group_id).unwrap_or_default();
            files.sort_by(|a, b| a.file_label.cmp(&b.file_label));
            ObjectReport { object, files }
        })
        .collect();
    report.sort_by(|a, b| {
        (a.object.sharing_group, &a.object.object_type, a.object.group_id).cmp(&(
            b.object.sharing_group,
            &b.object.object_type,
            b.object.group_id,
        ))
    });
    Ok(report)
}

/// Run the objects command.
pub async fn run(store: &SqliteStore, include_deleted: bool, json: bool) -> Result<()> {
    let report = report(store, include_deleted).await?;
    if json {
        return print_json(&report);
    }

    if report.is_empty() {
        println!("No objects.");
        return Ok(());
    }
    for entry in &report {
        let object = &entry.object;
        println!("{} {} (group {})", object.object_type, object.group_id, object.sharing_group);
        if object.deleted_locally {
            println!("  deleted locally");
        }
        if object.deleted_on_server {
            println!("  deleted on server");
        }
        for file in &entry.files {
            println!(
                "  {:<12} {} local={} server={}{}",
                file.file_label,
                file.file_id,
                version(file.local_version),
                version(file.server_version),
                if file.is_deleted() { " deleted" } else { "" },
            );
        }
    }
    Ok(())
}

fn version<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_client::WriteBatch;
    use objsync_types::{FileGroupId, FileId, FileVersion, SharingGroupId};
    use tempfile::tempdir;

    async fn seeded() -> (tempfile::TempDir, SqliteStore, ObjectEntry, ObjectEntry) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("objsync.db")).await.unwrap();

        let sharing_group = SharingGroupId::new();
        let live = ObjectEntry::new(FileGroupId::new(), sharing_group, "note");
        let mut gone = ObjectEntry::new(FileGroupId::new(), sharing_group, "note");
        gone.mark_deleted_on_server();

        let mut body = FileEntry::new_local(FileId::new(), live.group_id, "body", "text/plain");
        body.record_server_version(FileVersion::new(1)).unwrap();
        let image = FileEntry::new_local(FileId::new(), live.group_id, "image", "image/png");
        let orphan = FileEntry::new_local(FileId::new(), gone.group_id, "body", "text/plain");

        let mut batch = WriteBatch::new();
        batch.put(&live).unwrap();
        batch.put(&gone).unwrap();
        batch.put(&image).unwrap();
        batch.put(&body).unwrap();
        batch.put(&orphan).unwrap();
        repository(&store).commit(batch).await.unwrap();

        (dir, store, live, gone)
    }

    #[tokio::test]
    async fn lists_live_objects_with_files() {
        let (_dir, store, live, _) = seeded().await;

        let report = report(&store, false).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].object.group_id, live.group_id);

        let labels: Vec<&str> = report[0].files.iter().map(|f| f.file_label.as_str()).collect();
        assert_eq!(labels, vec!["body", "image"]);
    }

    #[tokio::test]
    async fn deleted_objects_are_opt_in() {
        let (_dir, store, _, gone) = seeded().await;

        let report = report(&store, true).await.unwrap();
        assert_eq!(report.len(), 2);
        let deleted = report.iter().find(|r| r.object.group_id == gone.group_id).unwrap();
        assert!(deleted.object.deleted_on_server);
        assert_eq!(deleted.files.len(), 1);
    }

    #[test]
    fn missing_version_prints_dash() {
        assert_eq!(version::<FileVersion>(None), "-");
        assert_eq!(version(Some(FileVersion::new(3))), FileVersion::new(3).to_string());
    }
}
