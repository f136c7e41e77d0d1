//! End-to-end engine scenarios against the mock server.

use objsync_client::{
    ChannelObserver, ClientError, EngineConfig, EngineError, FileUpload, MemoryStore,
    MockNetworking, ObjectUpload, SqliteStore, SyncClient, SyncEvent, SyncStore,
};
use objsync_core::{
    DeletionStatus, DeletionTarget, DirectoryError, DownloadStatus, FileDeclaration,
    ObjectDeclaration, TransferKind, UploadStatus, ValidationError,
};
use objsync_types::{
    DeferredId, DeferredStatus, FileGroupId, FileId, FileRecord, FileVersion, GoneReason,
    IndexScope, SharingGroupId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn note() -> ObjectDeclaration {
    ObjectDeclaration::new("note")
        .with_file(FileDeclaration::new("body", "text/plain").with_change_resolver("replace"))
        .with_file(FileDeclaration::new("image", "image/png"))
}

struct Harness {
    client: SyncClient,
    network: MockNetworking,
    events: UnboundedReceiver<SyncEvent>,
    dir: TempDir,
    sharing_group: SharingGroupId,
}

impl Harness {
    async fn start() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), MockNetworking::new(), EngineConfig::default()).await
    }

    async fn with_store(store: Arc<dyn SyncStore>, network: MockNetworking, config: EngineConfig) -> Self {
        let (observer, events) = ChannelObserver::new();
        let client = SyncClient::builder(store, Arc::new(network.clone()))
            .config(config)
            .observer(Arc::new(observer))
            .start()
            .await
            .unwrap();
        client.register(note()).await.unwrap();
        Self {
            client,
            network,
            events,
            dir: TempDir::new().unwrap(),
            sharing_group: SharingGroupId::new(),
        }
    }

    fn source(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn upload(&self, group_id: FileGroupId, files: &[(FileId, &str)]) -> ObjectUpload {
        let mut upload = ObjectUpload::new("note", group_id, self.sharing_group);
        for (file_id, label) in files {
            let mime = if *label == "image" { "image/png" } else { "text/plain" };
            let path = self.source(&format!("{file_id}"), label.as_bytes());
            upload = upload.with_file(FileUpload::new(*file_id, label, mime, path));
        }
        upload
    }

    /// Queue, run to completion and return the events produced.
    async fn upload_and_settle(&mut self, group_id: FileGroupId, files: &[(FileId, &str)]) -> Vec<SyncEvent> {
        let upload = self.upload(group_id, files);
        self.client.queue_upload(upload).await.unwrap();
        self.settle().await
    }

    /// Wait for the engine to go idle, then collect delivered events.
    async fn settle(&mut self) -> Vec<SyncEvent> {
        self.client.wait_idle().await.unwrap();
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), self.events.recv()).await {
            events.push(event);
        }
        events
    }

    fn server_record(&self, group_id: FileGroupId, label: &str, version: u32) -> FileRecord {
        FileRecord {
            file_id: FileId::new(),
            group_id,
            sharing_group: self.sharing_group,
            object_type: "note".into(),
            file_label: label.into(),
            mime_type: if label == "image" { "image/png" } else { "text/plain" }.into(),
            server_version: FileVersion::new(version),
            deleted: false,
        }
    }
}

async fn wait_for_uploads(network: &MockNetworking, count: usize) {
    for _ in 0..200 {
        if network.uploads().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} upload calls, saw {}", network.uploads().len());
}

fn upload_completions(events: &[SyncEvent], group: FileGroupId) -> Vec<&SyncEvent> {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::UploadCompleted { group_id, .. } if *group_id == group))
        .collect()
}

// ===========================================
// Upload Scenarios
// ===========================================

#[tokio::test]
async fn v0_upload_success() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let (a, b) = (FileId::new(), FileId::new());

    let events = h.upload_and_settle(group, &[(a, "body"), (b, "image")]).await;

    assert!(h.client.pending_transfers().await.unwrap().is_empty());
    let completed = upload_completions(&events, group);
    assert_eq!(completed.len(), 1);
    match completed[0] {
        SyncEvent::UploadCompleted { files, v0, .. } => {
            assert!(*v0);
            assert_eq!(files.len(), 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(h.network.record(a).unwrap().server_version, FileVersion::zero());
    let files = h.client.files(group).await.unwrap();
    assert!(files.iter().all(|f| f.local_version == Some(FileVersion::zero())));
    assert!(h.client.objects_needing_download().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_file_is_retried_alone() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let (a, b) = (FileId::new(), FileId::new());
    h.network.fail_upload(b, 1);

    let events = h.upload_and_settle(group, &[(a, "body"), (b, "image")]).await;
    assert!(upload_completions(&events, group).is_empty());
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::Error(EngineError::Transport { kind: TransferKind::Upload, .. })
    )));

    let pending = h.client.pending_transfers().await.unwrap();
    assert_eq!(pending.uploads.len(), 1);
    let files = &pending.uploads[0].files;
    let status = |id: FileId| files.iter().find(|f| f.file_id == id).unwrap().status;
    assert_eq!(status(a), UploadStatus::Uploaded);
    assert_eq!(status(b), UploadStatus::NotStarted);

    h.client.sync(IndexScope::All).await.unwrap();
    let events = h.settle().await;

    let calls: Vec<FileId> = h.network.uploads().iter().map(|u| u.file_id).collect();
    assert_eq!(calls.iter().filter(|id| **id == a).count(), 1);
    assert_eq!(calls.iter().filter(|id| **id == b).count(), 2);
    assert_eq!(upload_completions(&events, group).len(), 1);
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn second_batch_waits_for_active_one() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let (a, c) = (FileId::new(), FileId::new());

    h.network.hold_transfers();
    let first = h.upload(group, &[(a, "body")]);
    h.client.queue_upload(first).await.unwrap();
    wait_for_uploads(&h.network, 1).await;

    let second = h.upload(group, &[(c, "image")]);
    h.client.queue_upload(second).await.unwrap();

    let pending = h.client.pending_transfers().await.unwrap();
    assert_eq!(pending.uploads.len(), 2);
    assert!(pending.uploads[1]
        .files
        .iter()
        .all(|f| f.status == UploadStatus::NotStarted));
    assert_eq!(h.network.uploads().len(), 1);

    h.network.release_transfers();
    h.settle().await;
    assert_eq!(h.client.pending_transfers().await.unwrap().uploads.len(), 1);

    h.client.sync(IndexScope::All).await.unwrap();
    let events = h.settle().await;
    assert_eq!(upload_completions(&events, group).len(), 1);
    assert_eq!(h.network.uploads().len(), 2);
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn mixed_batch_is_refused() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let a = FileId::new();
    h.upload_and_settle(group, &[(a, "body")]).await;

    let mixed = h.upload(group, &[(a, "body"), (FileId::new(), "image")]);
    let err = h.client.queue_upload(mixed).await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::Validation(ValidationError::Directory(DirectoryError::MixedVersions))
    ));
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
    assert_eq!(h.client.files(group).await.unwrap().len(), 1);
}

#[tokio::test]
async fn first_upload_conflict_remaps_to_server_file() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let winner = h.server_record(group, "body", 0);
    h.network.add_record(winner.clone());
    let local = FileId::new();

    let events = h.upload_and_settle(group, &[(local, "body")]).await;

    assert!(events.contains(&SyncEvent::UploadConflict {
        group_id: group,
        local_file_id: local,
        server_file_id: winner.file_id,
    }));
    assert!(upload_completions(&events, group).is_empty());

    let files = h.client.files(group).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_id, winner.file_id);
    assert!(files[0].needs_download());

    let needed = h.client.objects_needing_download().await.unwrap();
    assert_eq!(needed.len(), 1);
    assert_eq!(needed[0].files[0].file_id, winner.file_id);
}

#[tokio::test]
async fn upload_queued_during_conflict_targets_server_file() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let winner = h.server_record(group, "body", 0);
    h.network.add_record(winner.clone());
    let local = FileId::new();

    h.network.hold_transfers();
    let first = h.upload(group, &[(local, "body")]);
    h.client.queue_upload(first).await.unwrap();
    wait_for_uploads(&h.network, 1).await;

    let second = h.upload(group, &[(local, "body")]);
    h.client.queue_upload(second).await.unwrap();
    assert_eq!(h.network.uploads().len(), 1);

    h.network.release_transfers();
    h.settle().await;

    let pending = h.client.pending_transfers().await.unwrap();
    assert_eq!(pending.uploads.len(), 1);
    assert!(pending.uploads[0].files.iter().all(|f| f.file_id == winner.file_id));

    h.client.sync(IndexScope::All).await.unwrap();
    h.settle().await;

    let calls: Vec<(FileId, FileVersion)> = h
        .network
        .uploads()
        .iter()
        .map(|u| (u.file_id, u.version))
        .collect();
    assert_eq!(
        calls,
        vec![(local, FileVersion::zero()), (winner.file_id, FileVersion::new(1))]
    );
}

// ===========================================
// Deferred Completion Scenarios
// ===========================================

#[tokio::test]
async fn change_upload_completes_through_deferred_poll() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let a = FileId::new();
    h.upload_and_settle(group, &[(a, "body")]).await;

    let events = h.upload_and_settle(group, &[(a, "body")]).await;
    assert!(upload_completions(&events, group).is_empty());

    let pending = h.client.pending_transfers().await.unwrap();
    assert_eq!(pending.uploads[0].object.deferred_id, Some(DeferredId::new(1)));
    // Still pending on the first query
    h.network.script_deferred(DeferredId::new(1), [DeferredStatus::PendingChange]);

    assert_eq!(h.client.poll_deferred().await.unwrap(), 1);
    h.settle().await;
    assert_eq!(h.client.pending_transfers().await.unwrap().uploads.len(), 1);

    assert_eq!(h.client.poll_deferred().await.unwrap(), 1);
    let events = h.settle().await;

    assert!(events.contains(&SyncEvent::DeferredCompleted {
        deferred_id: DeferredId::new(1),
        kind: TransferKind::Upload,
    }));
    let completed = upload_completions(&events, group);
    assert_eq!(completed.len(), 1);
    assert!(matches!(completed[0], SyncEvent::UploadCompleted { v0: false, .. }));
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
    assert_eq!(h.network.record(a).unwrap().server_version, FileVersion::new(1));
    let files = h.client.files(group).await.unwrap();
    assert_eq!(files[0].local_version, Some(FileVersion::new(1)));

    // Nothing left to poll, a second completion cannot happen
    assert_eq!(h.client.poll_deferred().await.unwrap(), 0);
}

#[tokio::test]
async fn deferred_completion_survives_newer_server_version() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let a = FileId::new();
    h.upload_and_settle(group, &[(a, "body")]).await;
    h.upload_and_settle(group, &[(a, "body")]).await;

    // Another device's v2 lands while our v1 waits on the server
    let mut newer = h.network.record(a).unwrap();
    newer.server_version = FileVersion::new(2);
    h.network.add_record(newer);
    h.network.script_deferred(DeferredId::new(1), [DeferredStatus::PendingChange]);
    h.client.sync(IndexScope::All).await.unwrap();
    h.settle().await;
    assert_eq!(h.client.pending_transfers().await.unwrap().uploads.len(), 1);

    assert_eq!(h.client.poll_deferred().await.unwrap(), 1);
    let events = h.settle().await;

    assert!(!events.iter().any(|e| matches!(e, SyncEvent::Error(_))));
    assert!(events.contains(&SyncEvent::DeferredCompleted {
        deferred_id: DeferredId::new(1),
        kind: TransferKind::Upload,
    }));
    assert_eq!(upload_completions(&events, group).len(), 1);
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
    assert_eq!(h.client.poll_deferred().await.unwrap(), 0);

    let files = h.client.files(group).await.unwrap();
    assert_eq!(files[0].local_version, Some(FileVersion::new(1)));
    assert_eq!(files[0].server_version, Some(FileVersion::new(2)));
    let needed = h.client.objects_needing_download().await.unwrap();
    assert_eq!(needed.len(), 1);
    assert_eq!(needed[0].files[0].version, FileVersion::new(2));
}

#[tokio::test]
async fn unknown_deferred_id_is_reported() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let a = FileId::new();
    h.upload_and_settle(group, &[(a, "body")]).await;
    h.upload_and_settle(group, &[(a, "body")]).await;

    h.network.script_deferred(DeferredId::new(1), [DeferredStatus::Unknown]);
    h.client.poll_deferred().await.unwrap();
    let events = h.settle().await;

    assert!(events.contains(&SyncEvent::Error(EngineError::UnknownDeferredId(DeferredId::new(1)))));
    assert_eq!(h.client.pending_transfers().await.unwrap().uploads.len(), 1);
}

#[tokio::test]
async fn deletion_completes_after_deferred_poll() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let a = FileId::new();
    h.upload_and_settle(group, &[(a, "body")]).await;

    h.client.queue_deletion(DeletionTarget::Object(group)).await.unwrap();
    h.settle().await;

    let pending = h.client.pending_transfers().await.unwrap();
    assert_eq!(pending.deletions.len(), 1);
    assert_eq!(pending.deletions[0].status, DeletionStatus::WaitingForDeferredDeletion);

    h.client.poll_deferred().await.unwrap();
    let events = h.settle().await;

    assert!(events.contains(&SyncEvent::DeletionCompleted(DeletionTarget::Object(group))));
    assert!(events.contains(&SyncEvent::DeferredCompleted {
        deferred_id: DeferredId::new(1),
        kind: TransferKind::Deletion,
    }));
    assert!(h.network.record(a).unwrap().deleted);
    assert!(h.client.pending_transfers().await.unwrap().is_empty());

    let object = h.client.object(group).await.unwrap().unwrap();
    assert!(object.deleted_locally && object.deleted_on_server);
    assert!(h.client.objects_needing_local_deletion().await.unwrap().is_empty());

    let err = h
        .client
        .queue_deletion(DeletionTarget::Object(group))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Validation(ValidationError::ObjectDeleted(_))));
}

// ===========================================
// Gone and Server Deletion Scenarios
// ===========================================

#[tokio::test]
async fn gone_upload_requires_local_deletion() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let a = FileId::new();
    h.upload_and_settle(group, &[(a, "body")]).await;
    h.network.delete_record(a);

    let events = h.upload_and_settle(group, &[(a, "body")]).await;

    assert!(events.contains(&SyncEvent::LocalDeletionRequired {
        group_id: group,
        files: vec![a],
        whole_object: true,
        reason: Some(GoneReason::FileRemovedOrRenamed),
    }));
    assert!(upload_completions(&events, group).is_empty());

    let pending = h.client.objects_needing_local_deletion().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].whole_object);
    assert_eq!(pending[0].files, vec![a]);

    h.client
        .mark_local_deletion_handled(DeletionTarget::Object(group))
        .await
        .unwrap();
    assert!(h.client.objects_needing_local_deletion().await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_reports_server_deletions_and_new_objects() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let (a, b) = (FileId::new(), FileId::new());
    h.upload_and_settle(group, &[(a, "body"), (b, "image")]).await;

    let remote_group = FileGroupId::new();
    let remote = h.server_record(remote_group, "body", 2);
    h.network.add_record(remote.clone());
    h.network.delete_record(b);

    let summary = h.client.sync(IndexScope::All).await.unwrap();
    let events = h.settle().await;

    assert_eq!(summary.files_deleted_on_server, 1);
    assert_eq!(summary.objects_deleted_on_server, 0);
    assert_eq!(summary.records_rejected, 0);
    assert!(events.contains(&SyncEvent::LocalDeletionRequired {
        group_id: group,
        files: vec![b],
        whole_object: false,
        reason: None,
    }));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::SyncCompleted(_))));

    let pending = h.client.objects_needing_local_deletion().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].whole_object);
    assert_eq!(pending[0].files, vec![b]);

    let needed = h.client.objects_needing_download().await.unwrap();
    assert_eq!(needed.len(), 1);
    assert_eq!(needed[0].group_id, remote_group);
    assert_eq!(needed[0].files[0].version, FileVersion::new(2));

    let groups = h.client.sharing_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].sharing_group, h.sharing_group);
}

#[tokio::test]
async fn failed_index_fetch_changes_nothing() {
    let mut h = Harness::start().await;
    h.network.add_record(h.server_record(FileGroupId::new(), "body", 0));
    h.network
        .fail_next_fetch(objsync_client::TransportError::Timeout);

    let err = h.client.sync(IndexScope::All).await.unwrap_err();
    let events = h.settle().await;

    assert!(matches!(err, ClientError::Transport(_)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Error(EngineError::IndexFetch(_)))));
    assert!(h.client.objects_needing_download().await.unwrap().is_empty());
}

// ===========================================
// Download Scenarios
// ===========================================

#[tokio::test]
async fn download_delivers_latest_version() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let record = h.server_record(group, "body", 3);
    h.network.add_record(record.clone());
    h.client.sync(IndexScope::All).await.unwrap();
    h.settle().await;

    h.client.queue_download_latest(group).await.unwrap();
    let events = h.settle().await;

    let delivered = events
        .iter()
        .find_map(|e| match e {
            SyncEvent::DownloadCompleted(object) => Some(object),
            _ => None,
        })
        .unwrap();
    assert_eq!(delivered.group_id, group);
    assert_eq!(delivered.files.len(), 1);
    assert_eq!(delivered.files[0].version, FileVersion::new(3));

    let files = h.client.files(group).await.unwrap();
    assert_eq!(files[0].local_version, Some(FileVersion::new(3)));
    assert!(h.client.objects_needing_download().await.unwrap().is_empty());
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn download_retry_exhaustion_evicts_tracker() {
    let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
    let config = EngineConfig::default().with_download_retry_limit(1);
    let mut h = Harness::with_store(store, MockNetworking::new(), config).await;
    let group = FileGroupId::new();
    let record = h.server_record(group, "body", 0);
    h.network.add_record(record.clone());
    h.client.sync(IndexScope::All).await.unwrap();
    h.settle().await;
    h.network.fail_download(record.file_id, 2);

    h.client.queue_download_latest(group).await.unwrap();
    h.settle().await;

    let pending = h.client.pending_transfers().await.unwrap();
    assert_eq!(pending.downloads.len(), 1);
    assert_eq!(pending.downloads[0].files[0].status, DownloadStatus::NotStarted);
    assert_eq!(pending.downloads[0].files[0].attempts, 1);
    // Queued, so not reported as needing download
    assert!(h.client.objects_needing_download().await.unwrap().is_empty());

    h.client.sync(IndexScope::All).await.unwrap();
    let events = h.settle().await;

    assert!(events.contains(&SyncEvent::Error(EngineError::DownloadRetriesExhausted {
        group_id: group,
        file_id: record.file_id,
        attempts: 2,
    })));
    assert!(h.client.pending_transfers().await.unwrap().is_empty());
    let needed = h.client.objects_needing_download().await.unwrap();
    assert_eq!(needed.len(), 1);
    assert_eq!(needed[0].files[0].file_id, record.file_id);
}

#[tokio::test]
async fn mark_as_downloaded_rejects_future_version() {
    let mut h = Harness::start().await;
    let group = FileGroupId::new();
    let record = h.server_record(group, "body", 1);
    h.network.add_record(record.clone());
    h.client.sync(IndexScope::All).await.unwrap();
    h.settle().await;

    let err = h
        .client
        .mark_as_downloaded(vec![objsync_core::FileDownload {
            file_id: record.file_id,
            version: FileVersion::new(2),
        }])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Validation(ValidationError::VersionNotOnServer { .. })
    ));

    h.client
        .mark_as_downloaded(vec![objsync_core::FileDownload {
            file_id: record.file_id,
            version: FileVersion::new(1),
        }])
        .await
        .unwrap();
    assert!(h.client.objects_needing_download().await.unwrap().is_empty());
}

// ===========================================
// Restart Scenarios
// ===========================================

#[tokio::test]
async fn queued_upload_survives_restart() {
    let db = TempDir::new().unwrap();
    let path = db.path().join("objsync.db");
    let network = MockNetworking::new();
    let group = FileGroupId::new();
    let a = FileId::new();
    network.fail_upload(a, 1);

    let store: Arc<dyn SyncStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let mut h = Harness::with_store(store, network.clone(), EngineConfig::default()).await;
    let upload = h.upload(group, &[(a, "body")]);
    h.client.queue_upload(upload).await.unwrap();
    h.settle().await;
    h.client.shutdown().await.unwrap();
    let sources = h.dir;

    let store: Arc<dyn SyncStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let (observer, mut events) = ChannelObserver::new();
    let client = SyncClient::builder(store, Arc::new(network.clone()))
        .observer(Arc::new(observer))
        .start()
        .await
        .unwrap();

    assert_eq!(client.declarations().await.unwrap(), vec![note()]);
    let pending = client.pending_transfers().await.unwrap();
    assert_eq!(pending.uploads.len(), 1);
    assert_eq!(pending.uploads[0].files[0].attempts, 1);

    client.sync(IndexScope::All).await.unwrap();
    client.wait_idle().await.unwrap();

    let mut completed = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if matches!(event, SyncEvent::UploadCompleted { group_id, .. } if group_id == group) {
            completed = true;
        }
    }
    assert!(completed);
    assert!(client.pending_transfers().await.unwrap().is_empty());
    assert!(network.record(a).is_some());
    drop(sources);
}
