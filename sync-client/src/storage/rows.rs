//! Row bindings for the directory and tracker types.

use objsync_core::{
    DeletionTracker, DownloadFileTracker, DownloadObjectTracker, FileEntry, ObjectDeclaration,
    ObjectEntry, SharingGroupEntry, UploadFileTracker, UploadObjectTracker,
};

use super::Row;

impl Row for ObjectEntry {
    const KIND: &'static str = "object";

    fn key(&self) -> String {
        self.group_id.to_string()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.sharing_group.to_string())
    }
}

impl Row for FileEntry {
    const KIND: &'static str = "file";

    fn key(&self) -> String {
        self.file_id.to_string()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.group_id.to_string())
    }
}

impl Row for SharingGroupEntry {
    const KIND: &'static str = "sharing_group";

    fn key(&self) -> String {
        self.sharing_group.to_string()
    }

    fn group_key(&self) -> Option<String> {
        None
    }
}

impl Row for ObjectDeclaration {
    const KIND: &'static str = "declaration";

    fn key(&self) -> String {
        self.object_type.clone()
    }

    fn group_key(&self) -> Option<String> {
        None
    }
}

impl Row for UploadObjectTracker {
    const KIND: &'static str = "upload_object";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.group_id.to_string())
    }
}

impl Row for UploadFileTracker {
    const KIND: &'static str = "upload_file";

    fn key(&self) -> String {
        self.id.to_string()
    }

    // Grouped by owning object tracker so a batch loads in one query
    fn group_key(&self) -> Option<String> {
        Some(self.object_tracker.to_string())
    }
}

impl Row for DownloadObjectTracker {
    const KIND: &'static str = "download_object";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.group_id.to_string())
    }
}

impl Row for DownloadFileTracker {
    const KIND: &'static str = "download_file";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.object_tracker.to_string())
    }
}

impl Row for DeletionTracker {
    const KIND: &'static str = "deletion";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn group_key(&self) -> Option<String> {
        Some(self.target.group_id().to_string())
    }
}
