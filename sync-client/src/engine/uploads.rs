//! Upload pipeline: queueing, dispatch, results and batch completion.

use objsync_core::dispatch::{idle_uploads, select_uploads};
use objsync_core::upload::{self, UploadCompletion};
use objsync_core::{
    DeletionTracker, DownloadFileTracker, FileEntry, FileRemap, ObjectEntry, PlanRequest,
    TransferKind, UploadFileTracker, UploadObjectTracker, UploadResult,
};
use objsync_types::{
    DeferredId, FileGroupId, FileId, FileVersion, GoneReason, TrackerId, UploadOutcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{now_secs, Command, Engine};
use crate::error::{ClientError, EngineError};
use crate::network::{TransportError, UploadRequest};
use crate::observer::SyncEvent;
use crate::storage::WriteBatch;

fn upload_request(object: &UploadObjectTracker, file: &UploadFileTracker) -> UploadRequest {
    UploadRequest {
        file_id: file.file_id,
        group_id: object.group_id,
        sharing_group: object.sharing_group,
        object_type: object.object_type.clone(),
        file_label: file.file_label.clone(),
        mime_type: file.mime_type.clone(),
        batch_id: object.batch_id,
        batch_expiry_secs: object.batch_expiry_secs,
        upload_index: file.upload_index,
        upload_count: file.upload_count,
        version: file.target_version,
        checksum: file.checksum.clone(),
        source: file.source.clone(),
    }
}

impl Engine {
    pub(super) async fn object_row(&self, group_id: FileGroupId) -> Result<Option<ObjectEntry>, ClientError> {
        Ok(self.repo.get(&group_id.to_string()).await?)
    }

    pub(super) async fn files_of(&self, group_id: FileGroupId) -> Result<Vec<FileEntry>, ClientError> {
        Ok(self.repo.by_group(&group_id.to_string()).await?)
    }

    pub(super) async fn file_row(&self, file_id: FileId) -> Result<Option<FileEntry>, ClientError> {
        Ok(self.repo.get(&file_id.to_string()).await?)
    }

    pub(super) async fn queue_upload(&mut self, request: PlanRequest) -> Result<TrackerId, ClientError> {
        let object = self.object_row(request.group_id).await?;
        let mut known = self.files_of(request.group_id).await?;
        for file in &request.files {
            if known.iter().any(|f| f.file_id == file.file_id) {
                continue;
            }
            // A known id stored under another object must still be caught
            if let Some(entry) = self.file_row(file.file_id).await? {
                known.push(entry);
            }
        }

        let seq = self.next_seq();
        let plan = upload::plan(
            &request,
            object.as_ref(),
            &known,
            &self.registry,
            self.config.batch_expiry_secs,
            seq,
        )?;

        let mut batch = WriteBatch::new();
        if let Some(object) = &plan.new_object {
            batch.put(object)?;
        }
        for file in &plan.directory_files {
            batch.put(file)?;
        }
        batch.put(&plan.object)?;
        for file in &plan.files {
            batch.put(file)?;
        }
        self.repo.commit(batch).await?;

        tracing::info!(
            "Queued {:?} upload of {} file(s) for {} (tracker {})",
            plan.kind,
            plan.files.len(),
            request.group_id,
            plan.object.id
        );
        self.notifier.emit(SyncEvent::TransferQueued {
            kind: TransferKind::Upload,
            group_id: request.group_id,
            tracker: plan.object.id,
        });

        let pass = self.upload_pass().await;
        self.report(pass);
        Ok(plan.object.id)
    }

    /// Re-target idle batches, then dispatch every eligible file.
    pub(super) async fn upload_pass(&mut self) -> Result<usize, ClientError> {
        let mut objects: Vec<UploadObjectTracker> = self.repo.all().await?;
        let mut files: Vec<UploadFileTracker> = self.repo.all().await?;
        let mut batch = WriteBatch::new();

        let idle: Vec<(TrackerId, FileGroupId)> = idle_uploads(&objects, &files)
            .map(|o| (o.id, o.group_id))
            .collect();
        for (tracker, group_id) in idle {
            let directory: BTreeMap<FileId, FileEntry> = self
                .files_of(group_id)
                .await?
                .into_iter()
                .map(|f| (f.file_id, f))
                .collect();
            let Some(object) = objects.iter_mut().find(|o| o.id == tracker) else {
                continue;
            };
            match upload::retarget(object, &mut files, &directory) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!("Re-targeted upload batch {} (v0: {})", tracker, object.v0_upload);
                    batch.put(&*object)?;
                    for file in files.iter().filter(|f| f.object_tracker == tracker) {
                        batch.put(file)?;
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping upload batch {} for {}: {}", tracker, group_id, e);
                    batch.delete(&*object);
                    for file in files.iter().filter(|f| f.object_tracker == tracker) {
                        batch.delete(file);
                    }
                    objects.retain(|o| o.id != tracker);
                    files.retain(|f| f.object_tracker != tracker);
                    self.notifier.error(EngineError::BatchDropped {
                        group_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let now = now_secs();
        let mut requests = Vec::new();
        for id in select_uploads(&objects, &files, now) {
            let Some(file) = files.iter_mut().find(|f| f.id == id) else {
                continue;
            };
            let Some(object) = objects.iter().find(|o| o.id == file.object_tracker) else {
                continue;
            };
            if let Err(e) = file.start(now, self.config.transfer_expiry_secs) {
                tracing::debug!("Skipping upload {}: {}", id, e);
                continue;
            }
            batch.put(&*file)?;
            requests.push((file.id, upload_request(object, file)));
        }
        self.repo.commit(batch).await?;

        let count = requests.len();
        for (tracker, request) in requests {
            tracing::debug!(
                "Dispatching upload {}/{} of file {} ({})",
                request.upload_index,
                request.upload_count,
                request.file_id,
                request.version
            );
            let network = Arc::clone(&self.network);
            self.spawn_call(async move {
                Command::UploadFinished {
                    tracker,
                    result: network.upload(request).await,
                }
            });
        }
        Ok(count)
    }

    pub(super) async fn on_upload_finished(
        &mut self,
        tracker: TrackerId,
        result: Result<UploadOutcome, TransportError>,
    ) -> Result<(), ClientError> {
        let Some(mut file) = self.repo.get::<UploadFileTracker>(&tracker.to_string()).await? else {
            tracing::debug!("Upload result for finished tracker {}, ignoring", tracker);
            return Ok(());
        };
        let Some(mut object) = self
            .repo
            .get::<UploadObjectTracker>(&file.object_tracker.to_string())
            .await?
        else {
            tracing::error!("Upload tracker {} has no object tracker", tracker);
            let mut batch = WriteBatch::new();
            batch.delete(&file);
            self.repo.commit(batch).await?;
            self.notifier.error(EngineError::Protocol(format!(
                "upload file tracker {tracker} has no object tracker"
            )));
            return Ok(());
        };

        let mut batch = WriteBatch::new();
        match result {
            Err(e) => {
                tracing::warn!("Upload of file {} failed: {}", file.file_id, e);
                if file.reset() {
                    batch.put(&file)?;
                    self.repo.commit(batch).await?;
                }
                self.notifier.error(EngineError::Transport {
                    kind: TransferKind::Upload,
                    message: e.to_string(),
                });
                return Ok(());
            }
            Ok(UploadOutcome::Success {
                finished,
                deferred_id,
            }) => {
                if !file.complete(UploadResult::Accepted) {
                    tracing::debug!("Upload {} already recorded, ignoring replay", tracker);
                    return Ok(());
                }
                tracing::debug!("Upload of file {} accepted ({:?})", file.file_id, finished);
                if object.v0_upload {
                    self.record_uploaded(file.file_id, file.target_version, &mut batch).await?;
                }
                if let Some(id) = deferred_id {
                    match object.deferred_id {
                        None => {
                            object.deferred_id = Some(id);
                            batch.put(&object)?;
                        }
                        Some(existing) if existing != id => {
                            tracing::error!(
                                "Batch {} got deferred id {} after {}",
                                object.id,
                                id,
                                existing
                            );
                            self.notifier.error(EngineError::Protocol(format!(
                                "upload batch for {} got deferred id {id} after {existing}",
                                object.group_id
                            )));
                        }
                        Some(_) => {}
                    }
                }
            }
            Ok(UploadOutcome::Gone(reason)) => {
                if !file.complete(UploadResult::Gone(reason)) {
                    return Ok(());
                }
                tracing::info!("Upload of file {} answered gone ({:?})", file.file_id, reason);
                if let Some(mut entry) = self.file_row(file.file_id).await? {
                    if entry.mark_gone(reason) {
                        batch.put(&entry)?;
                    }
                }
            }
            Ok(UploadOutcome::Conflict { server_file_id }) => {
                if !file.complete(UploadResult::Superseded) {
                    return Ok(());
                }
                if !object.v0_upload {
                    tracing::error!("Conflict reported for versioned upload {}", tracker);
                    self.notifier.error(EngineError::Protocol(format!(
                        "conflict reported for versioned upload of file {}",
                        file.file_id
                    )));
                } else if server_file_id != file.file_id {
                    let local_file_id = file.file_id;
                    let remap = FileRemap::after_conflict(local_file_id, server_file_id);
                    self.apply_remap(&remap, &mut batch).await?;
                    remap.apply_to_upload(&mut file);
                    tracing::info!(
                        "First upload of {} lost to {}, remapped",
                        local_file_id,
                        server_file_id
                    );
                    self.notifier.emit(SyncEvent::UploadConflict {
                        group_id: object.group_id,
                        local_file_id,
                        server_file_id,
                    });
                }
            }
        }

        // Last, so it wins over any copy the remap rewrote
        batch.put(&file)?;
        self.repo.commit(batch).await?;

        self.check_upload_completion(object).await
    }

    /// Record an accepted version in the directory. A version that would
    /// regress is logged and skipped; the batch still completes.
    async fn record_uploaded(
        &self,
        file_id: FileId,
        version: FileVersion,
        batch: &mut WriteBatch,
    ) -> Result<(), ClientError> {
        let Some(mut entry) = self.file_row(file_id).await? else {
            return Ok(());
        };
        match entry.record_uploaded_version(version) {
            Ok(true) => {
                batch.put(&entry)?;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Not recording uploaded version: {}", e),
        }
        Ok(())
    }

    /// Rewrite every reference to `remap.from`.
    pub(super) async fn apply_remap(&self, remap: &FileRemap, batch: &mut WriteBatch) -> Result<(), ClientError> {
        if let Some(entry) = self.file_row(remap.from).await? {
            if let Some(winner) = remap.apply_to_file(&entry) {
                batch.delete(&entry);
                if self.file_row(remap.to).await?.is_none() {
                    batch.put(&winner)?;
                }
            }
        }
        for mut tracker in self.repo.all::<UploadFileTracker>().await? {
            if remap.apply_to_upload(&mut tracker) {
                batch.put(&tracker)?;
            }
        }
        for mut tracker in self.repo.all::<DownloadFileTracker>().await? {
            if remap.apply_to_download(&mut tracker) {
                batch.put(&tracker)?;
            }
        }
        for mut tracker in self.repo.all::<DeletionTracker>().await? {
            if remap.apply_to_deletion(&mut tracker) {
                batch.put(&tracker)?;
            }
        }
        Ok(())
    }

    async fn check_upload_completion(&mut self, object: UploadObjectTracker) -> Result<(), ClientError> {
        let files: Vec<UploadFileTracker> = self.repo.by_group(&object.id.to_string()).await?;
        match upload::completion(&object, &files) {
            UploadCompletion::Pending => Ok(()),
            UploadCompletion::Finished => self.finish_upload(object, files, None).await,
            UploadCompletion::AwaitingDeferred(id) => {
                tracing::info!("Upload batch for {} waiting on deferred {}", object.group_id, id);
                self.refresh_poller().await?;
                Ok(())
            }
            UploadCompletion::MissingDeferredId => {
                tracing::error!("Versioned batch {} finished without a deferred id", object.id);
                let mut batch = WriteBatch::new();
                batch.delete(&object);
                for file in &files {
                    batch.delete(file);
                }
                self.repo.commit(batch).await?;
                self.notifier.error(EngineError::Protocol(format!(
                    "versioned upload batch for {} finished without a deferred id",
                    object.group_id
                )));
                Ok(())
            }
        }
    }

    /// Delete a finished batch and report it.
    ///
    /// `deferred` is set when a completed deferred operation finalizes a
    /// versioned batch; its accepted versions are recorded now.
    pub(super) async fn finish_upload(
        &mut self,
        object: UploadObjectTracker,
        files: Vec<UploadFileTracker>,
        deferred: Option<DeferredId>,
    ) -> Result<(), ClientError> {
        let mut batch = WriteBatch::new();

        if deferred.is_some() {
            for file in files.iter().filter(|f| f.accepted()) {
                self.record_uploaded(file.file_id, file.target_version, &mut batch).await?;
            }
        }

        let accepted: Vec<FileId> = files.iter().filter(|f| f.accepted()).map(|f| f.file_id).collect();
        let gone: Vec<(FileId, GoneReason)> = files
            .iter()
            .filter_map(|f| f.gone().map(|reason| (f.file_id, reason)))
            .collect();

        let mut whole_object = false;
        if !gone.is_empty() {
            let entries = self.files_of(object.group_id).await?;
            if entries.iter().all(|f| f.deleted_on_server) {
                whole_object = true;
                if let Some(mut row) = self.object_row(object.group_id).await? {
                    if row.mark_deleted_on_server() {
                        batch.put(&row)?;
                    }
                }
            }
        }

        batch.delete(&object);
        for file in &files {
            batch.delete(file);
        }
        self.repo.commit(batch).await?;

        tracing::info!(
            "Upload batch for {} finished: {} accepted, {} gone",
            object.group_id,
            accepted.len(),
            gone.len()
        );

        if let Some(id) = deferred {
            self.notifier.emit(SyncEvent::DeferredCompleted {
                deferred_id: id,
                kind: TransferKind::Upload,
            });
        }
        if !accepted.is_empty() {
            self.notifier.emit(SyncEvent::UploadCompleted {
                group_id: object.group_id,
                files: accepted,
                v0: object.v0_upload,
            });
            if let Some(message) = object.push_notification.clone() {
                self.send_push(object.sharing_group, message);
            }
        }
        if let Some((_, reason)) = gone.first() {
            self.notifier.emit(SyncEvent::LocalDeletionRequired {
                group_id: object.group_id,
                files: gone.iter().map(|(id, _)| *id).collect(),
                whole_object,
                reason: Some(*reason),
            });
        }

        self.refresh_poller().await?;
        Ok(())
    }

    /// A deferred operation for an upload batch completed.
    pub(super) async fn finalize_upload(&mut self, tracker: TrackerId, id: DeferredId) -> Result<(), ClientError> {
        let Some(object) = self.repo.get::<UploadObjectTracker>(&tracker.to_string()).await? else {
            tracing::debug!("Deferred {}: upload batch {} already finalized", id, tracker);
            return Ok(());
        };
        let files: Vec<UploadFileTracker> = self.repo.by_group(&object.id.to_string()).await?;
        self.finish_upload(object, files, Some(id)).await
    }
}
