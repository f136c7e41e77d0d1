//! Read-only views over the store.

use objsync_core::download;
use objsync_core::{
    DeletionTracker, DownloadFileTracker, DownloadObjectTracker, FileEntry, ObjectDownload,
    ObjectEntry, SharingGroupEntry, UploadFileTracker, UploadObjectTracker,
};
use objsync_types::{FileGroupId, FileId};
use serde::Serialize;

use super::{Engine, Query};
use crate::error::ClientError;
use crate::storage::{Repository, StoreError};

/// Something the server deleted that the app still holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingLocalDeletion {
    /// The object.
    pub group_id: FileGroupId,
    /// Declared type of the object.
    pub object_type: String,
    /// True when the whole object is gone.
    pub whole_object: bool,
    /// Files to remove locally.
    pub files: Vec<FileId>,
}

/// An upload batch and its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSnapshot {
    /// The batch.
    pub object: UploadObjectTracker,
    /// Its files.
    pub files: Vec<UploadFileTracker>,
}

/// A download request and its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSnapshot {
    /// The request.
    pub object: DownloadObjectTracker,
    /// Its files.
    pub files: Vec<DownloadFileTracker>,
}

/// Every tracker in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingTransfers {
    /// Upload batches in queue order.
    pub uploads: Vec<UploadSnapshot>,
    /// Download requests in queue order.
    pub downloads: Vec<DownloadSnapshot>,
    /// Deletions in queue order.
    pub deletions: Vec<DeletionTracker>,
}

impl PendingTransfers {
    /// Read every tracker from the store.
    pub async fn load(repo: &Repository) -> Result<Self, StoreError> {
        let mut upload_objects: Vec<UploadObjectTracker> = repo.all().await?;
        upload_objects.sort_by_key(|o| o.created_seq);
        let upload_files: Vec<UploadFileTracker> = repo.all().await?;
        let uploads = upload_objects
            .into_iter()
            .map(|object| {
                let mut files: Vec<UploadFileTracker> = upload_files
                    .iter()
                    .filter(|f| f.object_tracker == object.id)
                    .cloned()
                    .collect();
                files.sort_by_key(|f| f.upload_index);
                UploadSnapshot { object, files }
            })
            .collect();

        let mut download_objects: Vec<DownloadObjectTracker> = repo.all().await?;
        download_objects.sort_by_key(|o| o.created_seq);
        let download_files: Vec<DownloadFileTracker> = repo.all().await?;
        let downloads = download_objects
            .into_iter()
            .map(|object| DownloadSnapshot {
                files: download_files
                    .iter()
                    .filter(|f| f.object_tracker == object.id)
                    .cloned()
                    .collect(),
                object,
            })
            .collect();

        let mut deletions: Vec<DeletionTracker> = repo.all().await?;
        deletions.sort_by_key(|d| d.created_seq);

        Ok(Self {
            uploads,
            downloads,
            deletions,
        })
    }

    /// True when nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.downloads.is_empty() && self.deletions.is_empty()
    }
}

impl Engine {
    pub(super) async fn query(&mut self, query: Query) {
        match query {
            Query::NeedingDownload(reply) => {
                let _ = reply.send(self.objects_needing_download().await);
            }
            Query::NeedingLocalDeletion(reply) => {
                let _ = reply.send(self.objects_needing_local_deletion().await);
            }
            Query::SharingGroups(reply) => {
                let result = self.repo.all::<SharingGroupEntry>().await.map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Query::Object(group_id, reply) => {
                let _ = reply.send(self.object_row(group_id).await);
            }
            Query::Files(group_id, reply) => {
                let _ = reply.send(self.files_of(group_id).await);
            }
            Query::Declarations(reply) => {
                let _ = reply.send(Ok(self.registry.iter().cloned().collect()));
            }
            Query::PendingTransfers(reply) => {
                let result = PendingTransfers::load(&self.repo).await.map_err(ClientError::from);
                let _ = reply.send(result);
            }
        }
    }

    async fn objects_needing_download(&self) -> Result<Vec<ObjectDownload>, ClientError> {
        let objects: Vec<ObjectEntry> = self.repo.all().await?;
        let files: Vec<FileEntry> = self.repo.all().await?;
        let trackers: Vec<DownloadFileTracker> = self.repo.all().await?;
        Ok(download::needing_download(&objects, &files, &trackers))
    }

    async fn objects_needing_local_deletion(&self) -> Result<Vec<PendingLocalDeletion>, ClientError> {
        let objects: Vec<ObjectEntry> = self.repo.all().await?;
        let mut pending = Vec::new();
        for object in objects {
            if object.deleted_locally {
                continue;
            }
            let files: Vec<FileId> = self
                .files_of(object.group_id)
                .await?
                .into_iter()
                .filter(|f| f.deleted_on_server && !f.deleted_locally)
                .map(|f| f.file_id)
                .collect();
            if object.needs_local_deletion() || !files.is_empty() {
                pending.push(PendingLocalDeletion {
                    group_id: object.group_id,
                    object_type: object.object_type,
                    whole_object: object.deleted_on_server,
                    files,
                });
            }
        }
        Ok(pending)
    }
}
