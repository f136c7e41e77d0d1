//! Upload trackers.
//!
//! One [`UploadObjectTracker`] governs a batch of files for one object; each
//! file has an [`UploadFileTracker`] moving `NotStarted → Uploading →
//! Uploaded`. A batch is either all first uploads (v0) or all changes to
//! files the server already has (vN), never a mix.

use objsync_types::{
    BatchId, DeferredId, FileGroupId, FileId, FileVersion, GoneReason, SharingGroupId, TrackerId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::directory::{batch_kind, BatchKind, FileEntry, ObjectEntry};
use crate::registry::ObjectRegistry;
use crate::tracker::{deadline, TrackerError, ValidationError};

/// Per-file upload state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    /// Waiting for a trigger pass.
    NotStarted,
    /// Handed to the network.
    Uploading,
    /// The server answered. Kept until the whole batch is done.
    Uploaded,
}

impl UploadStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
        }
    }
}

/// How the server settled one uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadResult {
    /// The server accepted the bytes.
    Accepted,
    /// The server no longer has the target.
    Gone(GoneReason),
    /// Another device's first upload for the label won.
    Superseded,
}

/// A queued or in-flight upload batch for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadObjectTracker {
    /// Tracker id.
    pub id: TrackerId,
    /// The object.
    pub group_id: FileGroupId,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
    /// Declared object type.
    pub object_type: String,
    /// True for a first-upload batch.
    pub v0_upload: bool,
    /// Batch id sent with every file.
    pub batch_id: BatchId,
    /// How long the server keeps an unfinished batch.
    pub batch_expiry_secs: u64,
    /// Deferred operation applying a vN batch.
    pub deferred_id: Option<DeferredId>,
    /// Push notification sent once the batch is done.
    pub push_notification: Option<String>,
    /// Queue order.
    pub created_seq: u64,
}

/// One file of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileTracker {
    /// Tracker id.
    pub id: TrackerId,
    /// Owning object tracker.
    pub object_tracker: TrackerId,
    /// The object.
    pub group_id: FileGroupId,
    /// The file.
    pub file_id: FileId,
    /// Current state.
    pub status: UploadStatus,
    /// Version this upload produces.
    pub target_version: FileVersion,
    /// MIME type of the bytes.
    pub mime_type: String,
    /// Label of the file.
    pub file_label: String,
    /// Position within the batch, starting at 1.
    pub upload_index: u32,
    /// Number of files in the batch.
    pub upload_count: u32,
    /// Hex SHA-256 of the source.
    pub checksum: String,
    /// Local source of the bytes.
    pub source: PathBuf,
    /// Stall deadline while uploading, in unix seconds.
    pub expires_at: Option<u64>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Server verdict once uploaded.
    pub result: Option<UploadResult>,
}

impl UploadFileTracker {
    fn transition_error(&self, to: UploadStatus) -> TrackerError {
        TrackerError::InvalidTransition {
            tracker: self.id,
            from: self.status.name(),
            to: to.name(),
        }
    }

    /// Hand the file to the network.
    ///
    /// Allowed from `NotStarted`, or from `Uploading` once stalled.
    pub fn start(&mut self, now: u64, expiry_secs: u64) -> Result<(), TrackerError> {
        let allowed = match self.status {
            UploadStatus::NotStarted => true,
            UploadStatus::Uploading => self.is_stalled(now),
            UploadStatus::Uploaded => false,
        };
        if !allowed {
            return Err(self.transition_error(UploadStatus::Uploading));
        }
        self.status = UploadStatus::Uploading;
        self.expires_at = Some(deadline(now, expiry_secs));
        Ok(())
    }

    /// Record the server verdict.
    ///
    /// Returns false if the file was already uploaded, so replays change
    /// nothing.
    pub fn complete(&mut self, result: UploadResult) -> bool {
        if self.status == UploadStatus::Uploaded {
            return false;
        }
        self.status = UploadStatus::Uploaded;
        self.expires_at = None;
        self.result = Some(result);
        true
    }

    /// Put a failed file back in the queue.
    ///
    /// Returns false if the file was already uploaded.
    pub fn reset(&mut self) -> bool {
        if self.status == UploadStatus::Uploaded {
            return false;
        }
        self.status = UploadStatus::NotStarted;
        self.expires_at = None;
        self.attempts = self.attempts.saturating_add(1);
        true
    }

    /// Uploading past its deadline.
    pub fn is_stalled(&self, now: u64) -> bool {
        self.status == UploadStatus::Uploading && self.expires_at.map_or(true, |at| now >= at)
    }

    /// True once uploaded and accepted.
    pub fn accepted(&self) -> bool {
        self.result == Some(UploadResult::Accepted)
    }

    /// Gone reason, if the server reported one.
    pub fn gone(&self) -> Option<GoneReason> {
        match self.result {
            Some(UploadResult::Gone(reason)) => Some(reason),
            _ => None,
        }
    }
}

/// An object tracker is active once any file left `NotStarted` or the
/// batch waits on a deferred operation.
pub fn object_is_active(object: &UploadObjectTracker, files: &[UploadFileTracker]) -> bool {
    object.deferred_id.is_some()
        || files
            .iter()
            .filter(|f| f.object_tracker == object.id)
            .any(|f| f.status != UploadStatus::NotStarted)
}

/// Where a batch stands once its files have reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCompletion {
    /// Files are still outstanding.
    Pending,
    /// Every file is uploaded; trackers can be deleted.
    Finished,
    /// Every file is uploaded; the server is applying the vN batch.
    AwaitingDeferred(DeferredId),
    /// A vN batch finished without the server naming a deferred operation.
    MissingDeferredId,
}

/// Decide what the batch needs next.
pub fn completion(object: &UploadObjectTracker, files: &[UploadFileTracker]) -> UploadCompletion {
    let members: Vec<&UploadFileTracker> = files
        .iter()
        .filter(|f| f.object_tracker == object.id)
        .collect();
    if members.iter().any(|f| f.status != UploadStatus::Uploaded) {
        return UploadCompletion::Pending;
    }
    if object.v0_upload {
        return UploadCompletion::Finished;
    }
    match object.deferred_id {
        Some(id) => UploadCompletion::AwaitingDeferred(id),
        None if members.iter().all(|f| !f.accepted()) => UploadCompletion::Finished,
        None => UploadCompletion::MissingDeferredId,
    }
}

/// One file in an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// The file. New ids create a file; known ids change it.
    pub file_id: FileId,
    /// Label of the file.
    pub file_label: String,
    /// MIME type of the bytes.
    pub mime_type: String,
    /// Local source.
    pub source: PathBuf,
    /// Hex SHA-256 of the source.
    pub checksum: String,
}

/// A validated upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    /// Declared object type.
    pub object_type: String,
    /// The object.
    pub group_id: FileGroupId,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
    /// Files to upload.
    pub files: Vec<PlannedFile>,
    /// Push notification sent once the batch is done.
    pub push_notification: Option<String>,
}

/// Rows produced by a successful plan.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// v0 or vN.
    pub kind: BatchKind,
    /// The object tracker.
    pub object: UploadObjectTracker,
    /// File trackers in upload order.
    pub files: Vec<UploadFileTracker>,
    /// Object row to create when the object is new.
    pub new_object: Option<ObjectEntry>,
    /// File rows to create or update.
    pub directory_files: Vec<FileEntry>,
}

/// Validate an upload request and build its trackers.
///
/// `object` is the stored object row, if any. `known` holds every stored
/// file of the object plus any stored file named by the request.
pub fn plan(
    request: &PlanRequest,
    object: Option<&ObjectEntry>,
    known: &[FileEntry],
    registry: &ObjectRegistry,
    batch_expiry_secs: u64,
    created_seq: u64,
) -> Result<UploadPlan, ValidationError> {
    if request.files.is_empty() {
        return Err(ValidationError::EmptyRequest);
    }

    let declaration = registry.require(&request.object_type)?;

    let mut ids = BTreeSet::new();
    let mut labels = BTreeSet::new();
    for file in &request.files {
        if !ids.insert(file.file_id) {
            return Err(ValidationError::DuplicateFileId(file.file_id));
        }
        if !labels.insert(file.file_label.as_str()) {
            return Err(ValidationError::DuplicateLabel(file.file_label.clone()));
        }
        declaration.check_file(&file.file_label, &file.mime_type)?;
    }

    let new_object = match object {
        Some(stored) => {
            if stored.object_type != request.object_type
                || stored.sharing_group != request.sharing_group
            {
                return Err(ValidationError::DeclarationMismatch {
                    group_id: request.group_id,
                });
            }
            if stored.is_deleted() {
                return Err(ValidationError::ObjectDeleted(request.group_id));
            }
            None
        }
        None => Some(ObjectEntry::new(
            request.group_id,
            request.sharing_group,
            &request.object_type,
        )),
    };

    let by_id: BTreeMap<FileId, &FileEntry> = known.iter().map(|f| (f.file_id, f)).collect();
    let mut directory_files = Vec::with_capacity(request.files.len());
    for file in &request.files {
        match by_id.get(&file.file_id) {
            Some(stored) => {
                if stored.group_id != request.group_id {
                    return Err(ValidationError::FileInOtherGroup {
                        file_id: file.file_id,
                        actual: stored.group_id,
                    });
                }
                if stored.is_deleted() {
                    return Err(ValidationError::FileDeleted(file.file_id));
                }
                if stored.file_label != file.file_label {
                    return Err(ValidationError::LabelChanged {
                        file_id: file.file_id,
                        stored: stored.file_label.clone(),
                    });
                }
                let mut updated = (*stored).clone();
                updated.mime_type = file.mime_type.clone();
                directory_files.push(updated);
            }
            None => {
                let taken = known.iter().any(|f| {
                    f.group_id == request.group_id
                        && !f.is_deleted()
                        && f.file_label == file.file_label
                });
                if taken {
                    return Err(ValidationError::LabelTaken(file.file_label.clone()));
                }
                directory_files.push(FileEntry::new_local(
                    file.file_id,
                    request.group_id,
                    &file.file_label,
                    &file.mime_type,
                ));
            }
        }
    }

    let kind = batch_kind(directory_files.iter().map(|f| f.server_version))?;
    if !kind.is_v0() {
        for file in &directory_files {
            let resolver = declaration
                .file(&file.file_label)
                .and_then(|d| d.change_resolver.as_ref());
            if resolver.is_none() {
                return Err(ValidationError::NoChangeResolver(file.file_label.clone()));
            }
        }
    }

    let object_tracker = UploadObjectTracker {
        id: TrackerId::new(),
        group_id: request.group_id,
        sharing_group: request.sharing_group,
        object_type: request.object_type.clone(),
        v0_upload: kind.is_v0(),
        batch_id: BatchId::new(),
        batch_expiry_secs,
        deferred_id: None,
        push_notification: request.push_notification.clone(),
        created_seq,
    };

    let count = request.files.len() as u32;
    let files = request
        .files
        .iter()
        .zip(&directory_files)
        .enumerate()
        .map(|(i, (file, entry))| UploadFileTracker {
            id: TrackerId::new(),
            object_tracker: object_tracker.id,
            group_id: request.group_id,
            file_id: file.file_id,
            status: UploadStatus::NotStarted,
            target_version: target_version(entry.server_version),
            mime_type: file.mime_type.clone(),
            file_label: file.file_label.clone(),
            upload_index: i as u32 + 1,
            upload_count: count,
            checksum: file.checksum.clone(),
            source: file.source.clone(),
            expires_at: None,
            attempts: 0,
            result: None,
        })
        .collect();

    Ok(UploadPlan {
        kind,
        object: object_tracker,
        files,
        new_object,
        directory_files,
    })
}

fn target_version(server_version: Option<FileVersion>) -> FileVersion {
    server_version.map_or_else(FileVersion::zero, |v| v.next())
}

/// Re-derive v0/vN for a batch that has not started yet.
///
/// Files may gain a server version while queued, for example after a
/// conflict remap. Returns whether anything changed; a batch that became
/// mixed is an error and must be dropped by the caller.
pub fn retarget(
    object: &mut UploadObjectTracker,
    files: &mut [UploadFileTracker],
    directory: &BTreeMap<FileId, FileEntry>,
) -> Result<bool, ValidationError> {
    let server_version = |id: &FileId| directory.get(id).and_then(|f| f.server_version);
    let kind = batch_kind(
        files
            .iter()
            .filter(|f| f.object_tracker == object.id)
            .map(|f| server_version(&f.file_id)),
    )?;

    let mut changed = object.v0_upload != kind.is_v0();
    object.v0_upload = kind.is_v0();
    for file in files.iter_mut().filter(|f| f.object_tracker == object.id) {
        let target = target_version(server_version(&file.file_id));
        if file.target_version != target {
            file.target_version = target;
            changed = true;
        }
    }
    Ok(changed)
}
