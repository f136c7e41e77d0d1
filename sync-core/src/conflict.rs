//! Remapping a losing local file id onto the server's winner.
//!
//! When two devices upload the first version of the same label, the server
//! keeps one file id. The loser rewrites every reference to its own id so
//! queued work keeps pointing at a real file.

use objsync_types::{FileId, FileVersion};

use crate::deletion::{DeletionTarget, DeletionTracker};
use crate::directory::FileEntry;
use crate::download::DownloadFileTracker;
use crate::upload::UploadFileTracker;

/// Replace `from` with `to` everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRemap {
    /// The losing local id.
    pub from: FileId,
    /// The id the server kept.
    pub to: FileId,
    /// Version of the winner on the server.
    pub server_version: FileVersion,
}

impl FileRemap {
    /// A remap after a first-upload conflict.
    pub fn after_conflict(from: FileId, to: FileId) -> Self {
        Self {
            from,
            to,
            server_version: FileVersion::zero(),
        }
    }

    /// The directory row for the winner, built from the loser's row.
    ///
    /// This device never downloaded the winner, so it has no local version
    /// and is reported as needing download.
    pub fn apply_to_file(&self, entry: &FileEntry) -> Option<FileEntry> {
        if entry.file_id != self.from {
            return None;
        }
        Some(FileEntry {
            file_id: self.to,
            local_version: None,
            server_version: Some(self.server_version),
            ..entry.clone()
        })
    }

    /// Point an upload file tracker at the winner.
    pub fn apply_to_upload(&self, tracker: &mut UploadFileTracker) -> bool {
        if tracker.file_id != self.from {
            return false;
        }
        tracker.file_id = self.to;
        true
    }

    /// Point a download file tracker at the winner.
    pub fn apply_to_download(&self, tracker: &mut DownloadFileTracker) -> bool {
        if tracker.file_id != self.from {
            return false;
        }
        tracker.file_id = self.to;
        true
    }

    /// Point a single-file deletion at the winner.
    pub fn apply_to_deletion(&self, tracker: &mut DeletionTracker) -> bool {
        match tracker.target {
            DeletionTarget::File { group_id, file_id } if file_id == self.from => {
                tracker.target = DeletionTarget::File {
                    group_id,
                    file_id: self.to,
                };
                true
            }
            _ => false,
        }
    }
}
