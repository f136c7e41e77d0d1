//! Index reconciliation and deferred polling.

use objsync_core::upload::{self, UploadCompletion};
use objsync_core::{
    upsert_from_server_index, DeletionStatus, DeletionTracker, FileEntry, FileRemap, ObjectEntry,
    SharingGroupEntry, TransferKind, UploadFileTracker, UploadObjectTracker,
};
use objsync_types::{DeferredId, DeferredStatus, FileGroupId, FileId, IndexScope, ServerIndex};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Command, Engine, Reply, Waiter};
use crate::error::{ClientError, EngineError};
use crate::network::TransportError;
use crate::observer::{SyncEvent, SyncSummary};
use crate::storage::WriteBatch;

impl Engine {
    pub(super) fn start_sync(&mut self, scope: IndexScope, reply: Reply<SyncSummary>) {
        tracing::info!("Sync started ({:?})", scope);
        let network = Arc::clone(&self.network);
        self.spawn_call(async move {
            Command::IndexFetched {
                scope,
                result: network.fetch_index(scope).await,
                reply,
            }
        });
    }

    pub(super) async fn on_index_fetched(
        &mut self,
        scope: IndexScope,
        result: Result<ServerIndex, TransportError>,
    ) -> Result<SyncSummary, ClientError> {
        let index = match result {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!("Index fetch failed, sync aborted: {}", e);
                self.notifier.error(EngineError::IndexFetch(e.to_string()));
                return Err(e.into());
            }
        };

        let mut summary = self.reconcile(scope, index).await?;
        summary.uploads_dispatched = self.upload_pass().await?;
        summary.downloads_dispatched = self.download_pass().await?;
        summary.deletions_dispatched = self.deletion_pass().await?;
        summary.deferred_polled = self.poll_pass().await?;
        self.refresh_poller().await?;

        tracing::info!(
            "Sync finished: {} rows reconciled, {} uploads, {} downloads, {} deletions dispatched",
            summary.rows_reconciled,
            summary.uploads_dispatched,
            summary.downloads_dispatched,
            summary.deletions_dispatched
        );
        self.notifier.emit(SyncEvent::SyncCompleted(summary.clone()));
        Ok(summary)
    }

    /// Merge the index into the directory and report what changed.
    async fn reconcile(&mut self, scope: IndexScope, index: ServerIndex) -> Result<SyncSummary, ClientError> {
        let objects: BTreeMap<FileGroupId, ObjectEntry> = self
            .repo
            .all::<ObjectEntry>()
            .await?
            .into_iter()
            .map(|o| (o.group_id, o))
            .collect();
        let files: BTreeMap<FileId, FileEntry> = self
            .repo
            .all::<FileEntry>()
            .await?
            .into_iter()
            .map(|f| (f.file_id, f))
            .collect();

        let reconciliation = upsert_from_server_index(&objects, &files, &index.files, &self.registry);

        let mut batch = WriteBatch::new();
        for object in &reconciliation.objects {
            batch.put(object)?;
        }
        for file in &reconciliation.files {
            batch.put(file)?;
        }
        for group in &index.sharing_groups {
            batch.put(&SharingGroupEntry {
                sharing_group: group.sharing_group,
                name: group.name.clone(),
                deleted: group.deleted,
            })?;
        }
        self.repo.commit(batch).await?;

        for rejected in &reconciliation.rejected {
            tracing::warn!(
                "Index record for file {} in {} rejected: {}",
                rejected.file_id,
                rejected.group_id,
                rejected.error
            );
            self.notifier.error(EngineError::Reconcile {
                file_id: rejected.file_id,
                message: rejected.error.to_string(),
            });
        }

        // Another device's first upload for a label this device only has locally
        for conflict in &reconciliation.label_conflicts {
            let remap = FileRemap {
                from: conflict.local_file_id,
                to: conflict.server_file_id,
                server_version: conflict.server_version,
            };
            let mut batch = WriteBatch::new();
            self.apply_remap(&remap, &mut batch).await?;
            self.repo.commit(batch).await?;
            tracing::info!(
                "Label {} of {} already uploaded by another device as {}",
                conflict.file_label,
                conflict.group_id,
                conflict.server_file_id
            );
            self.notifier.emit(SyncEvent::UploadConflict {
                group_id: conflict.group_id,
                local_file_id: conflict.local_file_id,
                server_file_id: conflict.server_file_id,
            });
        }

        let mut files_deleted = 0;
        let mut objects_deleted = 0;
        for deletion in &reconciliation.deletions {
            files_deleted += deletion.files.len();
            if deletion.whole_object {
                objects_deleted += 1;
            }
            tracing::info!(
                "Server deleted {} file(s) of {} (whole object: {})",
                deletion.files.len(),
                deletion.group_id,
                deletion.whole_object
            );
            self.notifier.emit(SyncEvent::LocalDeletionRequired {
                group_id: deletion.group_id,
                files: deletion.files.clone(),
                whole_object: deletion.whole_object,
                reason: None,
            });
        }

        Ok(SyncSummary {
            scope,
            rows_reconciled: reconciliation.objects.len() + reconciliation.files.len(),
            files_deleted_on_server: files_deleted,
            objects_deleted_on_server: objects_deleted,
            records_rejected: reconciliation.rejected.len(),
            uploads_dispatched: 0,
            downloads_dispatched: 0,
            deletions_dispatched: 0,
            deferred_polled: 0,
        })
    }

    /// Query every waiting deferred operation not already being queried.
    pub(super) async fn poll_pass(&mut self) -> Result<usize, ClientError> {
        let mut waiting = Vec::new();

        let uploads: Vec<UploadObjectTracker> = self.repo.all().await?;
        for object in uploads {
            let files: Vec<UploadFileTracker> = self.repo.by_group(&object.id.to_string()).await?;
            if let UploadCompletion::AwaitingDeferred(id) = upload::completion(&object, &files) {
                waiting.push((Waiter::Upload(object.id), id));
            }
        }
        let deletions: Vec<DeletionTracker> = self.repo.all().await?;
        for deletion in deletions {
            if let (DeletionStatus::WaitingForDeferredDeletion, Some(id)) =
                (deletion.status, deletion.deferred_id)
            {
                waiting.push((Waiter::Deletion(deletion.id), id));
            }
        }

        let mut count = 0;
        for (waiter, deferred_id) in waiting {
            if !self.querying.insert(waiter) {
                continue;
            }
            count += 1;
            let network = Arc::clone(&self.network);
            self.spawn_call(async move {
                Command::DeferredStatus {
                    waiter,
                    deferred_id,
                    result: network.query_deferred_status(deferred_id).await,
                }
            });
        }
        if count > 0 {
            tracing::debug!("Polling {} deferred operation(s)", count);
        }
        Ok(count)
    }

    pub(super) async fn on_deferred_status(
        &mut self,
        waiter: Waiter,
        deferred_id: DeferredId,
        result: Result<DeferredStatus, TransportError>,
    ) -> Result<(), ClientError> {
        self.querying.remove(&waiter);
        let kind = match waiter {
            Waiter::Upload(_) => TransferKind::Upload,
            Waiter::Deletion(_) => TransferKind::Deletion,
        };

        match result {
            Err(e) => {
                tracing::warn!("Deferred status query for {} failed: {}", deferred_id, e);
                self.notifier.error(EngineError::Transport {
                    kind,
                    message: e.to_string(),
                });
            }
            Ok(status) if status.is_pending() => {
                tracing::debug!("Deferred {} still pending ({:?})", deferred_id, status);
            }
            Ok(DeferredStatus::Completed) => match waiter {
                Waiter::Upload(tracker) => self.finalize_upload(tracker, deferred_id).await?,
                Waiter::Deletion(tracker) => self.finalize_deletion(tracker, deferred_id).await?,
            },
            Ok(DeferredStatus::Error) => {
                tracing::error!("Deferred operation {} failed on the server", deferred_id);
                self.notifier
                    .error(EngineError::DeferredOperationFailed(deferred_id));
            }
            Ok(_) => {
                tracing::error!("Server does not know deferred operation {}", deferred_id);
                self.notifier.error(EngineError::UnknownDeferredId(deferred_id));
            }
        }
        Ok(())
    }
}
