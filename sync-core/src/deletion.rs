//! Deletion trackers.

use objsync_types::{DeferredId, FileGroupId, FileId, TrackerId};
use serde::{Deserialize, Serialize};

use crate::directory::{FileEntry, ObjectEntry};
use crate::tracker::{deadline, TrackerError, ValidationError};

/// What a deletion removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionTarget {
    /// A whole object and all its files.
    Object(FileGroupId),
    /// A single file.
    File {
        /// Owning object.
        group_id: FileGroupId,
        /// The file.
        file_id: FileId,
    },
}

impl DeletionTarget {
    /// The object the target belongs to.
    pub fn group_id(&self) -> FileGroupId {
        match self {
            Self::Object(group_id) | Self::File { group_id, .. } => *group_id,
        }
    }

    /// The file, for single-file targets.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Self::Object(_) => None,
            Self::File { file_id, .. } => Some(*file_id),
        }
    }

    /// True if deleting `self` also deletes `other`, or the other way round.
    pub fn overlaps(&self, other: &DeletionTarget) -> bool {
        match (self, other) {
            (Self::Object(a), b) | (b, Self::Object(a)) => *a == b.group_id(),
            (Self::File { file_id: a, .. }, Self::File { file_id: b, .. }) => a == b,
        }
    }
}

/// Deletion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionStatus {
    /// Waiting for a trigger pass.
    NotStarted,
    /// Handed to the network.
    Deleting,
    /// The server queued the deletion as a deferred operation.
    WaitingForDeferredDeletion,
    /// Finished. Never persisted.
    Done,
}

impl DeletionStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Deleting => "deleting",
            Self::WaitingForDeferredDeletion => "waiting for deferred deletion",
            Self::Done => "done",
        }
    }
}

/// One deletion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionTracker {
    /// Tracker id.
    pub id: TrackerId,
    /// What is deleted.
    pub target: DeletionTarget,
    /// Current state.
    pub status: DeletionStatus,
    /// Deferred operation applying the deletion.
    pub deferred_id: Option<DeferredId>,
    /// Stall deadline while deleting, in unix seconds.
    pub expires_at: Option<u64>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Queue order.
    pub created_seq: u64,
}

impl DeletionTracker {
    /// Create a tracker for a target.
    pub fn new(target: DeletionTarget, created_seq: u64) -> Self {
        Self {
            id: TrackerId::new(),
            target,
            status: DeletionStatus::NotStarted,
            deferred_id: None,
            expires_at: None,
            attempts: 0,
            created_seq,
        }
    }

    fn invalid(&self, to: DeletionStatus) -> TrackerError {
        TrackerError::InvalidTransition {
            tracker: self.id,
            from: self.status.name(),
            to: to.name(),
        }
    }

    /// Hand the deletion to the network.
    pub fn start(&mut self, now: u64, expiry_secs: u64) -> Result<(), TrackerError> {
        let allowed = match self.status {
            DeletionStatus::NotStarted => true,
            DeletionStatus::Deleting => self.is_stalled(now),
            _ => false,
        };
        if !allowed {
            return Err(self.invalid(DeletionStatus::Deleting));
        }
        self.status = DeletionStatus::Deleting;
        self.expires_at = Some(deadline(now, expiry_secs));
        Ok(())
    }

    /// The server queued the deletion.
    pub fn wait_for(&mut self, deferred_id: DeferredId) -> Result<(), TrackerError> {
        if self.status != DeletionStatus::Deleting {
            return Err(self.invalid(DeletionStatus::WaitingForDeferredDeletion));
        }
        self.status = DeletionStatus::WaitingForDeferredDeletion;
        self.deferred_id = Some(deferred_id);
        self.expires_at = None;
        Ok(())
    }

    /// Put a failed deletion back in the queue.
    pub fn reset(&mut self) -> bool {
        if self.status != DeletionStatus::Deleting {
            return false;
        }
        self.status = DeletionStatus::NotStarted;
        self.expires_at = None;
        self.attempts = self.attempts.saturating_add(1);
        true
    }

    /// Mark finished. Returns false if it already was.
    pub fn finish(&mut self) -> bool {
        !matches!(
            std::mem::replace(&mut self.status, DeletionStatus::Done),
            DeletionStatus::Done
        )
    }

    /// Deleting past its deadline.
    pub fn is_stalled(&self, now: u64) -> bool {
        self.status == DeletionStatus::Deleting && self.expires_at.map_or(true, |at| now >= at)
    }

    /// In flight or waiting on the server.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            DeletionStatus::Deleting | DeletionStatus::WaitingForDeferredDeletion
        )
    }
}

/// Directory rows changed by a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionMarks {
    /// Updated object row.
    pub object: Option<ObjectEntry>,
    /// Updated file rows.
    pub files: Vec<FileEntry>,
}

/// Validate a deletion request and mark its target deleted locally.
///
/// `files` holds the stored files of the target's object; `existing` every
/// queued deletion tracker.
pub fn plan(
    target: DeletionTarget,
    object: Option<&ObjectEntry>,
    files: &[FileEntry],
    existing: &[DeletionTracker],
    created_seq: u64,
) -> Result<(DeletionTracker, DeletionMarks), ValidationError> {
    let group_id = target.group_id();
    let object = object.ok_or(ValidationError::UnknownObject(group_id))?;
    if object.is_deleted() {
        return Err(ValidationError::ObjectDeleted(group_id));
    }
    if existing.iter().any(|t| t.target.overlaps(&target)) {
        return Err(ValidationError::AlreadyQueued);
    }

    let mut marks = DeletionMarks::default();
    match target.file_id() {
        Some(file_id) => {
            let file = files
                .iter()
                .find(|f| f.file_id == file_id)
                .ok_or(ValidationError::UnknownFile(file_id))?;
            if file.group_id != group_id {
                return Err(ValidationError::FileInOtherGroup {
                    file_id,
                    actual: file.group_id,
                });
            }
            if file.is_deleted() {
                return Err(ValidationError::FileDeleted(file_id));
            }
            let mut file = file.clone();
            file.mark_deleted_locally();
            marks.files.push(file);
        }
        None => {
            let mut object = object.clone();
            object.mark_deleted_locally();
            marks.object = Some(object);
            for file in files.iter().filter(|f| f.group_id == group_id) {
                let mut file = file.clone();
                if file.mark_deleted_locally() {
                    marks.files.push(file);
                }
            }
        }
    }

    Ok((DeletionTracker::new(target, created_seq), marks))
}

/// Mark a finished deletion's target deleted on the server.
pub fn apply_server_deletion(
    target: DeletionTarget,
    object: Option<&ObjectEntry>,
    files: &[FileEntry],
) -> DeletionMarks {
    let mut marks = DeletionMarks::default();
    let wanted = |f: &&FileEntry| match target {
        DeletionTarget::Object(group_id) => f.group_id == group_id,
        DeletionTarget::File { file_id, .. } => f.file_id == file_id,
    };
    for file in files.iter().filter(wanted) {
        let mut file = file.clone();
        if file.mark_deleted_on_server() {
            marks.files.push(file);
        }
    }
    if let (DeletionTarget::Object(_), Some(object)) = (target, object) {
        let mut object = object.clone();
        if object.mark_deleted_on_server() {
            marks.object = Some(object);
        }
    }
    marks
}
