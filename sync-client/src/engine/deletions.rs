//! Deletion pipeline.

use objsync_core::deletion;
use objsync_core::dispatch::select_deletions;
use objsync_core::{
    DeletionTarget, DeletionTracker, DownloadFileTracker, DownloadObjectTracker, DownloadStatus,
    TransferKind, UploadFileTracker, UploadObjectTracker, UploadStatus, ValidationError,
};
use objsync_types::{DeferredId, DeletionOutcome, TrackerId};
use std::sync::Arc;

use super::{now_secs, Command, Engine};
use crate::error::{ClientError, EngineError};
use crate::network::{DeletionRequest, TransportError};
use crate::observer::SyncEvent;
use crate::storage::WriteBatch;

fn hits(target: &DeletionTarget, file_id: objsync_types::FileId) -> bool {
    match target {
        DeletionTarget::Object(_) => true,
        DeletionTarget::File { file_id: wanted, .. } => *wanted == file_id,
    }
}

impl Engine {
    pub(super) async fn queue_deletion(&mut self, target: DeletionTarget) -> Result<TrackerId, ClientError> {
        let group_id = target.group_id();
        let object = self.object_row(group_id).await?;
        let files = self.files_of(group_id).await?;
        let existing: Vec<DeletionTracker> = self.repo.all().await?;
        let seq = self.next_seq();
        let (tracker, marks) = deletion::plan(target, object.as_ref(), &files, &existing, seq)?;

        let mut batch = WriteBatch::new();
        if let Some(object) = &marks.object {
            batch.put(object)?;
        }
        for file in &marks.files {
            batch.put(file)?;
        }
        batch.put(&tracker)?;
        self.drop_idle_transfers(&target, &mut batch).await?;
        self.repo.commit(batch).await?;

        tracing::info!("Queued deletion of {:?} (tracker {})", target, tracker.id);
        self.notifier.emit(SyncEvent::TransferQueued {
            kind: TransferKind::Deletion,
            group_id,
            tracker: tracker.id,
        });

        let pass = self.deletion_pass().await;
        self.report(pass);
        Ok(tracker.id)
    }

    /// Remove queued transfers that would touch what is being deleted.
    /// Transfers already on the network finish normally.
    async fn drop_idle_transfers(&self, target: &DeletionTarget, batch: &mut WriteBatch) -> Result<(), ClientError> {
        let group_key = target.group_id().to_string();

        let uploads: Vec<UploadObjectTracker> = self.repo.by_group(&group_key).await?;
        for object in uploads {
            let files: Vec<UploadFileTracker> = self.repo.by_group(&object.id.to_string()).await?;
            let idle = object.deferred_id.is_none()
                && files.iter().all(|f| f.status == UploadStatus::NotStarted);
            if idle && files.iter().any(|f| hits(target, f.file_id)) {
                tracing::info!("Dropping queued upload batch {} for deleted target", object.id);
                batch.delete(&object);
                for file in &files {
                    batch.delete(file);
                }
            }
        }

        let downloads: Vec<DownloadObjectTracker> = self.repo.by_group(&group_key).await?;
        for object in downloads {
            let files: Vec<DownloadFileTracker> = self.repo.by_group(&object.id.to_string()).await?;
            if files.iter().any(|f| f.status != DownloadStatus::NotStarted) {
                continue;
            }
            let (dropped, kept): (Vec<_>, Vec<_>) = files.iter().partition(|f| hits(target, f.file_id));
            if dropped.is_empty() {
                continue;
            }
            tracing::info!("Dropping {} queued download(s) for deleted target", dropped.len());
            for file in dropped {
                batch.delete(file);
            }
            if kept.is_empty() {
                batch.delete(&object);
            }
        }
        Ok(())
    }

    pub(super) async fn deletion_pass(&mut self) -> Result<usize, ClientError> {
        let mut deletions: Vec<DeletionTracker> = self.repo.all().await?;
        let upload_objects: Vec<UploadObjectTracker> = self.repo.all().await?;
        let upload_files: Vec<UploadFileTracker> = self.repo.all().await?;
        let now = now_secs();

        let mut batch = WriteBatch::new();
        let mut requests = Vec::new();
        for id in select_deletions(&deletions, &upload_objects, &upload_files, now) {
            let Some(tracker) = deletions.iter_mut().find(|d| d.id == id) else {
                continue;
            };
            let Some(object) = self.object_row(tracker.target.group_id()).await? else {
                tracing::error!("Deletion {} names unknown object", id);
                continue;
            };
            if let Err(e) = tracker.start(now, self.config.transfer_expiry_secs) {
                tracing::debug!("Skipping deletion {}: {}", id, e);
                continue;
            }
            batch.put(&*tracker)?;
            requests.push((
                tracker.id,
                DeletionRequest {
                    target: tracker.target,
                    sharing_group: object.sharing_group,
                },
            ));
        }
        self.repo.commit(batch).await?;

        let count = requests.len();
        for (tracker, request) in requests {
            tracing::debug!("Dispatching deletion of {:?}", request.target);
            let network = Arc::clone(&self.network);
            self.spawn_call(async move {
                Command::DeletionFinished {
                    tracker,
                    result: network.delete(request).await,
                }
            });
        }
        Ok(count)
    }

    pub(super) async fn on_deletion_finished(
        &mut self,
        tracker: TrackerId,
        result: Result<DeletionOutcome, TransportError>,
    ) -> Result<(), ClientError> {
        let Some(mut deletion) = self.repo.get::<DeletionTracker>(&tracker.to_string()).await? else {
            tracing::debug!("Deletion result for finished tracker {}, ignoring", tracker);
            return Ok(());
        };

        match result {
            Err(e) => {
                tracing::warn!("Deletion of {:?} failed: {}", deletion.target, e);
                if deletion.reset() {
                    let mut batch = WriteBatch::new();
                    batch.put(&deletion)?;
                    self.repo.commit(batch).await?;
                }
                self.notifier.error(EngineError::Transport {
                    kind: TransferKind::Deletion,
                    message: e.to_string(),
                });
                Ok(())
            }
            Ok(DeletionOutcome {
                deferred_id: Some(id),
            }) => {
                if let Err(e) = deletion.wait_for(id) {
                    tracing::debug!("Ignoring deletion result: {}", e);
                    return Ok(());
                }
                let mut batch = WriteBatch::new();
                batch.put(&deletion)?;
                self.repo.commit(batch).await?;
                tracing::info!("Deletion of {:?} waiting on deferred {}", deletion.target, id);
                self.refresh_poller().await?;
                Ok(())
            }
            Ok(DeletionOutcome { deferred_id: None }) => self.finish_deletion(deletion, None).await,
        }
    }

    /// Mark the target deleted on the server and drop the tracker.
    async fn finish_deletion(&mut self, mut deletion: DeletionTracker, deferred: Option<DeferredId>) -> Result<(), ClientError> {
        if !deletion.finish() {
            return Ok(());
        }
        let group_id = deletion.target.group_id();
        let object = self.object_row(group_id).await?;
        let files = self.files_of(group_id).await?;
        let marks = deletion::apply_server_deletion(deletion.target, object.as_ref(), &files);

        let mut batch = WriteBatch::new();
        if let Some(object) = &marks.object {
            batch.put(object)?;
        }
        for file in &marks.files {
            batch.put(file)?;
        }
        batch.delete(&deletion);
        self.repo.commit(batch).await?;

        tracing::info!("Deletion of {:?} applied on the server", deletion.target);
        if let Some(id) = deferred {
            self.notifier.emit(SyncEvent::DeferredCompleted {
                deferred_id: id,
                kind: TransferKind::Deletion,
            });
        }
        self.notifier.emit(SyncEvent::DeletionCompleted(deletion.target));
        self.refresh_poller().await?;
        Ok(())
    }

    /// A deferred deletion completed.
    pub(super) async fn finalize_deletion(&mut self, tracker: TrackerId, id: DeferredId) -> Result<(), ClientError> {
        let Some(deletion) = self.repo.get::<DeletionTracker>(&tracker.to_string()).await? else {
            tracing::debug!("Deferred {}: deletion {} already finalized", id, tracker);
            return Ok(());
        };
        self.finish_deletion(deletion, Some(id)).await
    }

    /// The app removed its local copy of something the server deleted.
    pub(super) async fn mark_local_deletion_handled(&mut self, target: DeletionTarget) -> Result<(), ClientError> {
        let group_id = target.group_id();
        let mut object = self
            .object_row(group_id)
            .await?
            .ok_or(ValidationError::UnknownObject(group_id))?;
        let files = self.files_of(group_id).await?;

        let mut batch = WriteBatch::new();
        match target {
            DeletionTarget::Object(_) => {
                if object.deleted_on_server && object.mark_deleted_locally() {
                    batch.put(&object)?;
                }
                for mut file in files {
                    if file.deleted_on_server && file.mark_deleted_locally() {
                        batch.put(&file)?;
                    }
                }
            }
            DeletionTarget::File { file_id, .. } => {
                let mut file = files
                    .into_iter()
                    .find(|f| f.file_id == file_id)
                    .ok_or(ValidationError::UnknownFile(file_id))?;
                if file.deleted_on_server && file.mark_deleted_locally() {
                    batch.put(&file)?;
                }
            }
        }
        tracing::debug!("Local deletion of {:?} handled ({} rows)", target, batch.len());
        self.repo.commit(batch).await?;
        Ok(())
    }
}
