//! Mock networking for testing.
//!
//! Keeps a small in-memory server: an index of file records, staged upload
//! batches and deferred operations. Outcomes can be scripted per file, and
//! every request is captured for verification.

use super::{DeletionRequest, DownloadRequest, Networking, TransportError, UploadRequest};
use async_trait::async_trait;
use objsync_core::DeletionTarget;
use objsync_types::{
    BatchId, DeferredId, DeferredStatus, DeletionOutcome, DownloadOutcome, FileId, FileRecord,
    GoneReason, IndexScope, ServerIndex, SharingGroupId, SharingGroupRecord, UploadFinished,
    UploadOutcome,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

type Script<T> = VecDeque<Result<T, TransportError>>;

#[derive(Debug)]
enum PendingWork {
    Change(Vec<FileRecord>),
    Deletion(DeletionTarget),
}

#[derive(Debug, Default)]
struct MockNetworkingInner {
    files: BTreeMap<FileId, FileRecord>,
    sharing_groups: BTreeMap<SharingGroupId, SharingGroupRecord>,
    staged: HashMap<BatchId, BTreeMap<FileId, FileRecord>>,
    pending: HashMap<DeferredId, PendingWork>,
    completed: BTreeSet<DeferredId>,
    next_deferred: u64,

    upload_script: HashMap<FileId, Script<UploadOutcome>>,
    download_script: HashMap<FileId, Script<DownloadOutcome>>,
    deletion_script: HashMap<DeletionTarget, Script<DeletionOutcome>>,
    deferred_script: HashMap<DeferredId, Script<DeferredStatus>>,
    fail_next_fetch: Option<TransportError>,

    uploads: Vec<UploadRequest>,
    downloads: Vec<DownloadRequest>,
    deletions: Vec<DeletionRequest>,
    deferred_queries: Vec<DeferredId>,
    index_fetches: Vec<IndexScope>,
    push_notifications: Vec<(SharingGroupId, String)>,
}

impl MockNetworkingInner {
    fn issue_deferred(&mut self, work: PendingWork) -> DeferredId {
        self.next_deferred += 1;
        let id = DeferredId::new(self.next_deferred);
        self.pending.insert(id, work);
        id
    }

    fn apply_deferred(&mut self, id: DeferredId) {
        match self.pending.remove(&id) {
            Some(PendingWork::Change(records)) => {
                for record in records {
                    self.files.insert(record.file_id, record);
                }
            }
            Some(PendingWork::Deletion(target)) => self.apply_deletion(target),
            None => {}
        }
        self.completed.insert(id);
    }

    fn apply_deletion(&mut self, target: DeletionTarget) {
        for record in self.files.values_mut() {
            let hit = match target {
                DeletionTarget::Object(group_id) => record.group_id == group_id,
                DeletionTarget::File { file_id, .. } => record.file_id == file_id,
            };
            if hit {
                record.deleted = true;
            }
        }
    }

    fn ensure_sharing_group(&mut self, sharing_group: SharingGroupId) {
        self.sharing_groups
            .entry(sharing_group)
            .or_insert(SharingGroupRecord {
                sharing_group,
                name: None,
                deleted: false,
            });
    }

    fn default_upload(&mut self, request: &UploadRequest) -> UploadOutcome {
        if let Some(existing) = self.files.get(&request.file_id) {
            if existing.deleted {
                return UploadOutcome::Gone(GoneReason::FileRemovedOrRenamed);
            }
        }

        if request.version.is_v0() {
            let winner = self.files.values().find(|r| {
                r.group_id == request.group_id
                    && r.file_label == request.file_label
                    && r.file_id != request.file_id
                    && !r.deleted
            });
            if let Some(winner) = winner {
                return UploadOutcome::Conflict {
                    server_file_id: winner.file_id,
                };
            }
        }

        let record = FileRecord {
            file_id: request.file_id,
            group_id: request.group_id,
            sharing_group: request.sharing_group,
            object_type: request.object_type.clone(),
            file_label: request.file_label.clone(),
            mime_type: request.mime_type.clone(),
            server_version: request.version,
            deleted: false,
        };
        let staged = self.staged.entry(request.batch_id).or_default();
        staged.insert(request.file_id, record);
        if (staged.len() as u32) < request.upload_count {
            return UploadOutcome::Success {
                finished: UploadFinished::NotFinished,
                deferred_id: None,
            };
        }

        let records: Vec<FileRecord> = self
            .staged
            .remove(&request.batch_id)
            .map(|batch| batch.into_values().collect())
            .unwrap_or_default();

        if request.version.is_v0() {
            self.ensure_sharing_group(request.sharing_group);
            for record in records {
                self.files.insert(record.file_id, record);
            }
            UploadOutcome::Success {
                finished: UploadFinished::V0UploadsFinished,
                deferred_id: None,
            }
        } else {
            let id = self.issue_deferred(PendingWork::Change(records));
            UploadOutcome::Success {
                finished: UploadFinished::VNTransferPending,
                deferred_id: Some(id),
            }
        }
    }

    fn default_download(&self, request: &DownloadRequest) -> DownloadOutcome {
        match self.files.get(&request.file_id) {
            Some(record) if record.deleted => DownloadOutcome::Gone(GoneReason::FileRemovedOrRenamed),
            _ => DownloadOutcome::Success {
                location: PathBuf::from(format!("mock://{}", request.file_id)),
                version: request.version,
            },
        }
    }
}

/// Mock networking for testing.
///
/// Without scripting it behaves like a well-mannered server: v0 batches
/// finish once every file arrived, vN batches and deletions complete on the
/// first deferred-status query, downloads succeed with a `mock://` location.
#[derive(Debug)]
pub struct MockNetworking {
    inner: Arc<Mutex<MockNetworkingInner>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for MockNetworking {
    fn default() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: Arc::default(),
            gate: Arc::new(gate),
        }
    }
}

impl Clone for MockNetworking {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl MockNetworking {
    /// Create a new mock server.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockNetworkingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pass_gate(&self) {
        let mut rx = self.gate.subscribe();
        // The sender lives as long as self, so this only ends when released
        let _ = rx.wait_for(|held| !*held).await;
    }

    // ===========================================
    // Flow control
    // ===========================================

    /// Park every transfer after it is recorded, until released.
    pub fn hold_transfers(&self) {
        self.gate.send_replace(true);
    }

    /// Let parked and future transfers proceed.
    pub fn release_transfers(&self) {
        self.gate.send_replace(false);
    }

    // ===========================================
    // Server index
    // ===========================================

    /// Add or replace a file record on the server.
    pub fn add_record(&self, record: FileRecord) {
        let mut inner = self.lock();
        inner.ensure_sharing_group(record.sharing_group);
        inner.files.insert(record.file_id, record);
    }

    /// Add or replace a sharing group.
    pub fn add_sharing_group(&self, record: SharingGroupRecord) {
        let mut inner = self.lock();
        inner.sharing_groups.insert(record.sharing_group, record);
    }

    /// Replace the whole server index.
    pub fn set_index(&self, index: ServerIndex) {
        let mut inner = self.lock();
        inner.files = index.files.into_iter().map(|r| (r.file_id, r)).collect();
        inner.sharing_groups = index
            .sharing_groups
            .into_iter()
            .map(|g| (g.sharing_group, g))
            .collect();
    }

    /// Mark a file deleted on the server.
    pub fn delete_record(&self, file_id: FileId) {
        let mut inner = self.lock();
        if let Some(record) = inner.files.get_mut(&file_id) {
            record.deleted = true;
        }
    }

    /// The server's record for a file.
    pub fn record(&self, file_id: FileId) -> Option<FileRecord> {
        self.lock().files.get(&file_id).cloned()
    }

    // ===========================================
    // Scripting
    // ===========================================

    /// Answer the next upload of `file_id` with `outcome`.
    pub fn script_upload(&self, file_id: FileId, outcome: Result<UploadOutcome, TransportError>) {
        let mut inner = self.lock();
        inner.upload_script.entry(file_id).or_default().push_back(outcome);
    }

    /// Fail the next `times` uploads of `file_id`.
    pub fn fail_upload(&self, file_id: FileId, times: usize) {
        for _ in 0..times {
            self.script_upload(file_id, Err(TransportError::Connection("mock failure".into())));
        }
    }

    /// Answer the next download of `file_id` with `outcome`.
    pub fn script_download(&self, file_id: FileId, outcome: Result<DownloadOutcome, TransportError>) {
        let mut inner = self.lock();
        inner.download_script.entry(file_id).or_default().push_back(outcome);
    }

    /// Fail the next `times` downloads of `file_id`.
    pub fn fail_download(&self, file_id: FileId, times: usize) {
        for _ in 0..times {
            self.script_download(file_id, Err(TransportError::Timeout));
        }
    }

    /// Answer the next deletion of `target` with `outcome`.
    ///
    /// A scripted `deferred_id: None` applies the deletion immediately.
    pub fn script_deletion(
        &self,
        target: DeletionTarget,
        outcome: Result<DeletionOutcome, TransportError>,
    ) {
        let mut inner = self.lock();
        inner.deletion_script.entry(target).or_default().push_back(outcome);
    }

    /// Answer the next status queries for `id` in order.
    pub fn script_deferred(&self, id: DeferredId, statuses: impl IntoIterator<Item = DeferredStatus>) {
        let mut inner = self.lock();
        let script = inner.deferred_script.entry(id).or_default();
        script.extend(statuses.into_iter().map(Ok));
    }

    /// Cause the next fetch_index() to fail with the given error.
    pub fn fail_next_fetch(&self, error: TransportError) {
        self.lock().fail_next_fetch = Some(error);
    }

    // ===========================================
    // Captured requests
    // ===========================================

    /// Every upload request received.
    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.lock().uploads.clone()
    }

    /// Every download request received.
    pub fn downloads(&self) -> Vec<DownloadRequest> {
        self.lock().downloads.clone()
    }

    /// Every deletion request received.
    pub fn deletions(&self) -> Vec<DeletionRequest> {
        self.lock().deletions.clone()
    }

    /// Every deferred id queried, in order.
    pub fn deferred_queries(&self) -> Vec<DeferredId> {
        self.lock().deferred_queries.clone()
    }

    /// Every index scope fetched.
    pub fn index_fetches(&self) -> Vec<IndexScope> {
        self.lock().index_fetches.clone()
    }

    /// Every push notification sent.
    pub fn push_notifications(&self) -> Vec<(SharingGroupId, String)> {
        self.lock().push_notifications.clone()
    }

    /// Deferred operations issued and not yet completed.
    pub fn pending_deferred(&self) -> Vec<DeferredId> {
        let mut ids: Vec<DeferredId> = self.lock().pending.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Networking for MockNetworking {
    async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, TransportError> {
        self.lock().uploads.push(request.clone());
        self.pass_gate().await;

        let mut inner = self.lock();
        if let Some(scripted) = inner
            .upload_script
            .get_mut(&request.file_id)
            .and_then(|s| s.pop_front())
        {
            return scripted;
        }
        Ok(inner.default_upload(&request))
    }

    async fn download(&self, request: DownloadRequest) -> Result<DownloadOutcome, TransportError> {
        self.lock().downloads.push(request.clone());
        self.pass_gate().await;

        let mut inner = self.lock();
        if let Some(scripted) = inner
            .download_script
            .get_mut(&request.file_id)
            .and_then(|s| s.pop_front())
        {
            return scripted;
        }
        Ok(inner.default_download(&request))
    }

    async fn delete(&self, request: DeletionRequest) -> Result<DeletionOutcome, TransportError> {
        self.lock().deletions.push(request.clone());
        self.pass_gate().await;

        let mut inner = self.lock();
        if let Some(scripted) = inner
            .deletion_script
            .get_mut(&request.target)
            .and_then(|s| s.pop_front())
        {
            if let Ok(DeletionOutcome { deferred_id: None }) = scripted {
                inner.apply_deletion(request.target);
            }
            return scripted;
        }
        let id = inner.issue_deferred(PendingWork::Deletion(request.target));
        Ok(DeletionOutcome {
            deferred_id: Some(id),
        })
    }

    async fn query_deferred_status(&self, id: DeferredId) -> Result<DeferredStatus, TransportError> {
        let mut inner = self.lock();
        inner.deferred_queries.push(id);

        if let Some(scripted) = inner.deferred_script.get_mut(&id).and_then(|s| s.pop_front()) {
            if let Ok(DeferredStatus::Completed) = scripted {
                inner.apply_deferred(id);
            }
            return scripted;
        }
        if inner.pending.contains_key(&id) {
            inner.apply_deferred(id);
            return Ok(DeferredStatus::Completed);
        }
        if inner.completed.contains(&id) {
            return Ok(DeferredStatus::Completed);
        }
        Ok(DeferredStatus::Unknown)
    }

    async fn fetch_index(&self, scope: IndexScope) -> Result<ServerIndex, TransportError> {
        let mut inner = self.lock();
        inner.index_fetches.push(scope);

        // Check for forced failure
        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(error);
        }

        let in_scope = |sharing_group: &SharingGroupId| match scope {
            IndexScope::All => true,
            IndexScope::SharingGroup(wanted) => *sharing_group == wanted,
        };
        Ok(ServerIndex {
            sharing_groups: inner
                .sharing_groups
                .values()
                .filter(|g| in_scope(&g.sharing_group))
                .cloned()
                .collect(),
            files: inner
                .files
                .values()
                .filter(|r| in_scope(&r.sharing_group))
                .cloned()
                .collect(),
        })
    }

    async fn send_push_notification(
        &self,
        sharing_group: SharingGroupId,
        message: String,
    ) -> Result<(), TransportError> {
        self.lock().push_notifications.push((sharing_group, message));
        Ok(())
    }
}
