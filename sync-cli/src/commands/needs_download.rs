//! List files with a newer server version that nobody is fetching.

use anyhow::Result;
use objsync_client::SqliteStore;
use objsync_core::download::needing_download;
use objsync_core::{DownloadFileTracker, FileEntry, ObjectDownload, ObjectEntry};

use super::repository;
use crate::store::print_json;

/// Gather the objects with files to fetch.
pub async fn report(store: &SqliteStore) -> Result<Vec<ObjectDownload>> {
    let repo = repository(store);
    let objects = repo.all::<ObjectEntry>().await?;
    let files = repo.all::<FileEntry>().await?;
    let trackers = repo.all::<DownloadFileTracker>().await?;
    Ok(needing_download(&objects, &files, &trackers))
}

/// Run the needs-download command.
pub async fn run(store: &SqliteStore, json: bool) -> Result<()> {
    let report = report(store).await?;
    if json {
        return print_json(&report);
    }

    if report.is_empty() {
        println!("Everything is up to date.");
        return Ok(());
    }
    for object in &report {
        println!("{}", object.group_id);
        for file in &object.files {
            println!("  {} -> {}", file.file_id, file.version);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_client::WriteBatch;
    use objsync_core::{DownloadObjectTracker, DownloadStatus};
    use objsync_types::{FileGroupId, FileId, FileVersion, SharingGroupId, TrackerId};
    use tempfile::tempdir;

    #[tokio::test]
    async fn queued_files_are_not_listed() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("objsync.db")).await.unwrap();

        let object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");
        let mut body = FileEntry::new_local(FileId::new(), object.group_id, "body", "text/plain");
        body.record_server_version(FileVersion::new(2)).unwrap();
        let mut image = FileEntry::new_local(FileId::new(), object.group_id, "image", "image/png");
        image.record_server_version(FileVersion::zero()).unwrap();

        let tracker = DownloadObjectTracker {
            id: TrackerId::new(),
            group_id: object.group_id,
            created_seq: 0,
        };
        let queued = DownloadFileTracker {
            id: TrackerId::new(),
            object_tracker: tracker.id,
            group_id: object.group_id,
            file_id: image.file_id,
            file_label: image.file_label.clone(),
            version: FileVersion::zero(),
            status: DownloadStatus::NotStarted,
            expires_at: None,
            attempts: 0,
            location: None,
            gone: false,
        };

        let mut batch = WriteBatch::new();
        batch.put(&object).unwrap();
        batch.put(&body).unwrap();
        batch.put(&image).unwrap();
        batch.put(&tracker).unwrap();
        batch.put(&queued).unwrap();
        repository(&store).commit(batch).await.unwrap();

        let report = report(&store).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].files.len(), 1);
        assert_eq!(report[0].files[0].file_id, body.file_id);
        assert_eq!(report[0].files[0].version, FileVersion::new(2));
    }

    #[tokio::test]
    async fn empty_store_needs_nothing() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("objsync.db")).await.unwrap();

        assert!(report(&store).await.unwrap().is_empty());
    }
}
