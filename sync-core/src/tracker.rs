//! Errors shared by the transfer tracker state machines.

use objsync_types::{FileGroupId, FileId, FileVersion, TrackerId};
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::registry::RegistryError;

/// Seconds-based deadline helper used by every tracker.
pub fn deadline(now: u64, expiry_secs: u64) -> u64 {
    now.saturating_add(expiry_secs)
}

/// Illegal state machine transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The tracker is not in a state that allows the transition.
    #[error("tracker {tracker} cannot go from {from} to {to}")]
    InvalidTransition {
        /// The tracker.
        tracker: TrackerId,
        /// Current state name.
        from: &'static str,
        /// Requested state name.
        to: &'static str,
    },
}

/// Reasons a queue request is refused before any tracker exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Nothing to queue.
    #[error("request names no files")]
    EmptyRequest,

    /// A file id appears twice in one request.
    #[error("file {0} appears more than once")]
    DuplicateFileId(FileId),

    /// A label appears twice in one request.
    #[error("label {0} appears more than once")]
    DuplicateLabel(String),

    /// The object was seen before with a different type or sharing group.
    #[error("object {group_id} was stored with a different declaration")]
    DeclarationMismatch {
        /// The object.
        group_id: FileGroupId,
    },

    /// The object is deleted locally or on the server.
    #[error("object {0} is deleted")]
    ObjectDeleted(FileGroupId),

    /// The file is deleted locally or on the server.
    #[error("file {0} is deleted")]
    FileDeleted(FileId),

    /// The file belongs to another object.
    #[error("file {file_id} belongs to object {actual}")]
    FileInOtherGroup {
        /// The file.
        file_id: FileId,
        /// The object it actually belongs to.
        actual: FileGroupId,
    },

    /// A known file was submitted under a different label.
    #[error("file {file_id} is labelled {stored}")]
    LabelChanged {
        /// The file.
        file_id: FileId,
        /// The stored label.
        stored: String,
    },

    /// A new file reuses a label already held by another file.
    #[error("label {0} is already used by another file of this object")]
    LabelTaken(String),

    /// A change to an existing file needs a change resolver.
    #[error("label {0} has no change resolver, so it cannot be changed")]
    NoChangeResolver(String),

    /// The file is not in the directory.
    #[error("unknown file {0}")]
    UnknownFile(FileId),

    /// The object is not in the directory.
    #[error("unknown object {0}")]
    UnknownObject(FileGroupId),

    /// The requested version is newer than anything on the server.
    #[error("version {version} of file {file_id} is not on the server")]
    VersionNotOnServer {
        /// The file.
        file_id: FileId,
        /// The requested version.
        version: FileVersion,
    },

    /// A deletion for the same target is already queued.
    #[error("a deletion for this target is already queued")]
    AlreadyQueued,

    /// The request does not fit the registered declaration.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The request breaks a directory invariant.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
