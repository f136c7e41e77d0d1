//! Server result shapes consumed by the sync engine.
//!
//! These are the minimal shapes the engine depends on. The networking
//! collaborator is responsible for turning real HTTP responses into them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{DeferredId, FileGroupId, FileId, FileVersion, SharingGroupId};

/// Why the server reported a file as gone.
///
/// The engine currently treats every reason as a deletion, including
/// `AuthTokenExpiredOrRevoked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoneReason {
    /// The file was deleted or replaced on the server.
    FileRemovedOrRenamed,
    /// The user who owned the file left the sharing group.
    UserRemoved,
    /// The cloud storage credentials behind the file are no longer valid.
    AuthTokenExpiredOrRevoked,
}

/// Which part of the server index to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexScope {
    /// Every sharing group the user belongs to.
    All,
    /// A single sharing group.
    SharingGroup(SharingGroupId),
}

/// One file as listed by the server index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// The file.
    pub file_id: FileId,
    /// The object the file belongs to.
    pub group_id: FileGroupId,
    /// The sharing group owning the object.
    pub sharing_group: SharingGroupId,
    /// Declared object type of the owning object.
    pub object_type: String,
    /// Label of the file within its object.
    pub file_label: String,
    /// MIME type of the current version.
    pub mime_type: String,
    /// Latest version present on the server.
    pub server_version: FileVersion,
    /// True once the file has been deleted on the server.
    pub deleted: bool,
}

/// One sharing group as listed by the server index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingGroupRecord {
    /// The sharing group.
    pub sharing_group: SharingGroupId,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// True once the sharing group has been removed.
    pub deleted: bool,
}

/// Result of an index fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIndex {
    /// Sharing groups visible to the user.
    pub sharing_groups: Vec<SharingGroupRecord>,
    /// Files in the requested scope.
    pub files: Vec<FileRecord>,
}

/// What the server said about the batch when accepting one file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadFinished {
    /// More files of the batch are still expected.
    NotFinished,
    /// Every file of a v0 batch has arrived; the object now exists.
    V0UploadsFinished,
    /// Every file of a vN batch has arrived; the server applies the change
    /// asynchronously under a deferred operation.
    VNTransferPending,
}

/// Terminal result of uploading one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadOutcome {
    /// The server accepted the file.
    Success {
        /// Batch progress as seen by the server.
        finished: UploadFinished,
        /// Deferred operation applying a vN batch, once assigned.
        deferred_id: Option<DeferredId>,
    },
    /// The target no longer exists on the server.
    Gone(GoneReason),
    /// Another device's v0 upload for the same file label landed first.
    Conflict {
        /// The id the server assigned to the winning file.
        server_file_id: FileId,
    },
}

/// Terminal result of downloading one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
    /// The file was downloaded.
    Success {
        /// Where the downloaded bytes were written.
        location: PathBuf,
        /// The version the server delivered.
        version: FileVersion,
    },
    /// The file or version no longer exists on the server.
    Gone(GoneReason),
}

/// Terminal result of a deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionOutcome {
    /// Deferred operation applying the deletion, if the server queued one.
    /// `None` means the deletion was already applied.
    pub deferred_id: Option<DeferredId>,
}

/// Status of a deferred operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferredStatus {
    /// A versioned upload batch is still being applied.
    PendingChange,
    /// A deletion is still being applied.
    PendingDeletion,
    /// The operation finished.
    Completed,
    /// The operation failed on the server.
    Error,
    /// The server does not know this id.
    Unknown,
}

impl DeferredStatus {
    /// True while the server is still working on the operation.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingChange | Self::PendingDeletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_statuses() {
        assert!(DeferredStatus::PendingChange.is_pending());
        assert!(DeferredStatus::PendingDeletion.is_pending());
        assert!(!DeferredStatus::Completed.is_pending());
        assert!(!DeferredStatus::Error.is_pending());
        assert!(!DeferredStatus::Unknown.is_pending());
    }

    #[test]
    fn upload_outcome_json_shape() {
        let outcome = UploadOutcome::Success {
            finished: UploadFinished::VNTransferPending,
            deferred_id: Some(DeferredId::new(9)),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["Success"]["finished"], "VNTransferPending");
        assert_eq!(json["Success"]["deferred_id"], 9);
    }

    #[test]
    fn server_index_defaults_empty() {
        let index = ServerIndex::default();
        assert!(index.files.is_empty());
        assert!(index.sharing_groups.is_empty());
    }
}
