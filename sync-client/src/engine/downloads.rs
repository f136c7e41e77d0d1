//! Download pipeline.

use objsync_core::dispatch::select_downloads;
use objsync_core::download::{self, DownloadFailure};
use objsync_core::{
    DownloadFileTracker, DownloadObjectTracker, FileDownload, ObjectDownload, TransferKind,
    ValidationError,
};
use objsync_types::{DownloadOutcome, FileGroupId, FileId, TrackerId};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{now_secs, Command, Engine};
use crate::error::{ClientError, EngineError};
use crate::network::{DownloadRequest, TransportError};
use crate::observer::SyncEvent;
use crate::storage::WriteBatch;

impl Engine {
    pub(super) async fn queue_download(&mut self, request: ObjectDownload) -> Result<TrackerId, ClientError> {
        let object = self.object_row(request.group_id).await?;
        let known = self.files_of(request.group_id).await?;
        let seq = self.next_seq();
        let (tracker, files) = download::plan(&request, object.as_ref(), &known, seq)?;

        let mut batch = WriteBatch::new();
        batch.put(&tracker)?;
        for file in &files {
            batch.put(file)?;
        }
        self.repo.commit(batch).await?;

        tracing::info!(
            "Queued download of {} file(s) for {} (tracker {})",
            files.len(),
            request.group_id,
            tracker.id
        );
        self.notifier.emit(SyncEvent::TransferQueued {
            kind: TransferKind::Download,
            group_id: request.group_id,
            tracker: tracker.id,
        });

        let pass = self.download_pass().await;
        self.report(pass);
        Ok(tracker.id)
    }

    /// Queue every file of the object that has a newer server version and
    /// is not already being downloaded.
    pub(super) async fn queue_download_latest(&mut self, group_id: FileGroupId) -> Result<TrackerId, ClientError> {
        if self.object_row(group_id).await?.is_none() {
            return Err(ValidationError::UnknownObject(group_id).into());
        }
        let known = self.files_of(group_id).await?;
        let queued = self.files_being_downloaded().await?;
        let mut request = ObjectDownload::latest(group_id, &known);
        request.files.retain(|f| !queued.contains(&f.file_id));
        self.queue_download(request).await
    }

    async fn files_being_downloaded(&self) -> Result<BTreeSet<FileId>, ClientError> {
        let trackers: Vec<DownloadFileTracker> = self.repo.all().await?;
        Ok(trackers.into_iter().map(|t| t.file_id).collect())
    }

    pub(super) async fn download_pass(&mut self) -> Result<usize, ClientError> {
        let objects: Vec<DownloadObjectTracker> = self.repo.all().await?;
        let mut files: Vec<DownloadFileTracker> = self.repo.all().await?;
        let now = now_secs();

        let mut batch = WriteBatch::new();
        let mut requests = Vec::new();
        for id in select_downloads(&objects, &files, now) {
            let Some(file) = files.iter_mut().find(|f| f.id == id) else {
                continue;
            };
            if let Err(e) = file.start(now, self.config.transfer_expiry_secs) {
                tracing::debug!("Skipping download {}: {}", id, e);
                continue;
            }
            batch.put(&*file)?;
            requests.push((
                file.id,
                DownloadRequest {
                    file_id: file.file_id,
                    group_id: file.group_id,
                    file_label: file.file_label.clone(),
                    version: file.version,
                },
            ));
        }
        self.repo.commit(batch).await?;

        let count = requests.len();
        for (tracker, request) in requests {
            tracing::debug!("Dispatching download of file {} ({})", request.file_id, request.version);
            let network = Arc::clone(&self.network);
            self.spawn_call(async move {
                Command::DownloadFinished {
                    tracker,
                    result: network.download(request).await,
                }
            });
        }
        Ok(count)
    }

    pub(super) async fn on_download_finished(
        &mut self,
        tracker: TrackerId,
        result: Result<DownloadOutcome, TransportError>,
    ) -> Result<(), ClientError> {
        let Some(mut file) = self.repo.get::<DownloadFileTracker>(&tracker.to_string()).await? else {
            tracing::debug!("Download result for finished tracker {}, ignoring", tracker);
            return Ok(());
        };

        let mut batch = WriteBatch::new();
        match result {
            Err(e) => match file.fail(self.config.download_retry_limit) {
                DownloadFailure::Retry => {
                    tracing::warn!(
                        "Download of file {} failed (attempt {}): {}",
                        file.file_id,
                        file.attempts,
                        e
                    );
                    batch.put(&file)?;
                    self.repo.commit(batch).await?;
                    self.notifier.error(EngineError::Transport {
                        kind: TransferKind::Download,
                        message: e.to_string(),
                    });
                    return Ok(());
                }
                DownloadFailure::Evict => {
                    tracing::warn!(
                        "Download of file {} failed {} times, giving up: {}",
                        file.file_id,
                        file.attempts,
                        e
                    );
                    batch.delete(&file);
                    let siblings: Vec<DownloadFileTracker> = self
                        .repo
                        .by_group::<DownloadFileTracker>(&file.object_tracker.to_string())
                        .await?
                        .into_iter()
                        .filter(|f| f.id != file.id)
                        .collect();
                    if siblings.is_empty() {
                        batch.delete_key::<DownloadObjectTracker>(file.object_tracker.to_string());
                    }
                    self.repo.commit(batch).await?;
                    self.notifier.error(EngineError::DownloadRetriesExhausted {
                        group_id: file.group_id,
                        file_id: file.file_id,
                        attempts: file.attempts,
                    });
                    if siblings.is_empty() {
                        return Ok(());
                    }
                    // The remaining files may all be done already
                    return self.check_download_completion(file.object_tracker).await;
                }
                DownloadFailure::Ignored => {
                    tracing::debug!("Late failure for downloaded file {}, ignoring", file.file_id);
                    return Ok(());
                }
            },
            Ok(DownloadOutcome::Success { location, version }) => {
                if !file.complete(location, version) {
                    tracing::debug!("Download {} already recorded, ignoring replay", tracker);
                    return Ok(());
                }
                tracing::debug!("Downloaded file {} ({})", file.file_id, version);
                batch.put(&file)?;
            }
            Ok(DownloadOutcome::Gone(reason)) => {
                if !file.mark_gone() {
                    return Ok(());
                }
                tracing::info!("Download of file {} answered gone ({:?})", file.file_id, reason);
                batch.put(&file)?;
                if let Some(mut entry) = self.file_row(file.file_id).await? {
                    if entry.mark_gone(reason) {
                        batch.put(&entry)?;
                    }
                }
            }
        }
        self.repo.commit(batch).await?;

        self.check_download_completion(file.object_tracker).await
    }

    /// Deliver and delete a download request once every file is in.
    async fn check_download_completion(&mut self, tracker: TrackerId) -> Result<(), ClientError> {
        let Some(object_tracker) = self.repo.get::<DownloadObjectTracker>(&tracker.to_string()).await? else {
            return Ok(());
        };
        let files: Vec<DownloadFileTracker> = self.repo.by_group(&tracker.to_string()).await?;
        if !download::is_complete(&object_tracker, &files) {
            return Ok(());
        }

        let group_id = object_tracker.group_id;
        let mut batch = WriteBatch::new();
        batch.delete(&object_tracker);
        for file in &files {
            batch.delete(file);
        }

        let Some(object) = self.object_row(group_id).await? else {
            self.repo.commit(batch).await?;
            tracing::error!("Download tracker {} names unknown object {}", tracker, group_id);
            self.notifier.error(EngineError::Protocol(format!(
                "download finished for unknown object {group_id}"
            )));
            return Ok(());
        };

        let mut directory = self.files_of(group_id).await?;
        for file in files.iter().filter(|f| !f.gone) {
            let Some(entry) = directory.iter_mut().find(|d| d.file_id == file.file_id) else {
                continue;
            };
            match entry.record_downloaded_version(file.version) {
                Ok(true) => {
                    batch.put(&*entry)?;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Not recording downloaded version: {}", e),
            }
        }

        let gone: Vec<FileId> = files.iter().filter(|f| f.gone).map(|f| f.file_id).collect();
        let reason = directory
            .iter()
            .find(|d| gone.contains(&d.file_id))
            .and_then(|d| d.gone_reason);
        let mut whole_object = false;
        if !gone.is_empty() && directory.iter().all(|f| f.deleted_on_server) {
            whole_object = true;
            let mut object = object.clone();
            if object.mark_deleted_on_server() {
                batch.put(&object)?;
            }
        }
        self.repo.commit(batch).await?;

        let delivered = download::assemble(&object, &object_tracker, &files, &directory);
        tracing::info!(
            "Download of {} finished ({} file(s), {} gone)",
            group_id,
            delivered.files.len(),
            gone.len()
        );
        if let Some(handler) = self.handlers.get(&object.object_type) {
            self.notifier.deliver(Arc::clone(handler), delivered.clone());
        }
        self.notifier.emit(SyncEvent::DownloadCompleted(delivered));
        if !gone.is_empty() {
            self.notifier.emit(SyncEvent::LocalDeletionRequired {
                group_id,
                files: gone,
                whole_object,
                reason,
            });
        }
        Ok(())
    }

    /// Record versions the caller obtained outside the engine.
    pub(super) async fn mark_as_downloaded(&mut self, files: Vec<FileDownload>) -> Result<(), ClientError> {
        let mut batch = WriteBatch::new();
        for wanted in &files {
            let mut entry = self
                .file_row(wanted.file_id)
                .await?
                .ok_or(ValidationError::UnknownFile(wanted.file_id))?;
            match entry.server_version {
                Some(server) if wanted.version <= server => {}
                _ => {
                    return Err(ValidationError::VersionNotOnServer {
                        file_id: wanted.file_id,
                        version: wanted.version,
                    }
                    .into())
                }
            }
            if entry.record_downloaded_version(wanted.version)? {
                batch.put(&entry)?;
            }
        }
        let written = batch.len();
        self.repo.commit(batch).await?;
        tracing::info!("Marked {} file(s) as downloaded", written);
        Ok(())
    }
}
