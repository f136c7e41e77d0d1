//! Observer delivery.
//!
//! The engine never calls observer code directly. Events and downloaded
//! objects go over an unbounded channel to a dispatcher task spawned on a
//! caller-chosen runtime, so a slow observer cannot stall the engine.

use objsync_core::{DeletionTarget, DownloadedObject, TransferKind};
use objsync_types::{DeferredId, FileGroupId, FileId, GoneReason, IndexScope, TrackerId};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Counts from one `sync()` pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// The scope that was fetched.
    pub scope: IndexScope,
    /// Object and file rows written from the index.
    pub rows_reconciled: usize,
    /// Files newly deleted on the server.
    pub files_deleted_on_server: usize,
    /// Objects newly deleted on the server.
    pub objects_deleted_on_server: usize,
    /// Index records that were not merged.
    pub records_rejected: usize,
    /// Upload file trackers handed to the network.
    pub uploads_dispatched: usize,
    /// Download file trackers handed to the network.
    pub downloads_dispatched: usize,
    /// Deletions handed to the network.
    pub deletions_dispatched: usize,
    /// Deferred operations queried.
    pub deferred_polled: usize,
}

/// Something the caller may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A `sync()` pass finished.
    SyncCompleted(SyncSummary),
    /// A queue request was accepted.
    TransferQueued {
        /// Which pipeline.
        kind: TransferKind,
        /// The object.
        group_id: FileGroupId,
        /// The new object or deletion tracker.
        tracker: TrackerId,
    },
    /// Every file of an upload batch is on the server.
    UploadCompleted {
        /// The object.
        group_id: FileGroupId,
        /// Files the server accepted.
        files: Vec<FileId>,
        /// True for a first-version batch.
        v0: bool,
    },
    /// Every file of a download request arrived.
    DownloadCompleted(DownloadedObject),
    /// A deletion is applied on the server.
    DeletionCompleted(DeletionTarget),
    /// A deferred operation finished.
    DeferredCompleted {
        /// The operation.
        deferred_id: DeferredId,
        /// Upload or deletion.
        kind: TransferKind,
    },
    /// The server deleted something this device still has.
    LocalDeletionRequired {
        /// The object.
        group_id: FileGroupId,
        /// The deleted files.
        files: Vec<FileId>,
        /// True when the whole object is gone.
        whole_object: bool,
        /// Set when a transfer was answered with "gone".
        reason: Option<GoneReason>,
    },
    /// A first upload lost to another device; the local id was replaced.
    UploadConflict {
        /// The object.
        group_id: FileGroupId,
        /// The id this device used.
        local_file_id: FileId,
        /// The id the server kept.
        server_file_id: FileId,
    },
    /// Something went wrong outside a caller request.
    Error(EngineError),
}

/// Receives engine events on the dispatcher task.
pub trait SyncObserver: Send + Sync + 'static {
    /// Handle one event. Runs on the observer runtime, never on the engine.
    fn on_event(&self, event: SyncEvent);
}

/// Receives completed downloads for one object type.
pub trait DownloadHandler: Send + Sync + 'static {
    /// Handle a downloaded object.
    fn object_downloaded(&self, object: DownloadedObject);
}

/// Observer that forwards events into a channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelObserver {
    /// Create the observer and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SyncObserver for ChannelObserver {
    fn on_event(&self, event: SyncEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

enum Delivery {
    Event(SyncEvent),
    Download(Arc<dyn DownloadHandler>, DownloadedObject),
}

/// Engine side of observer delivery.
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Notifier {
    /// Spawn the dispatcher on `runtime`.
    pub(crate) fn spawn(observer: Option<Arc<dyn SyncObserver>>, runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Event(event) => {
                        if let Some(observer) = &observer {
                            observer.on_event(event);
                        }
                    }
                    Delivery::Download(handler, object) => handler.object_downloaded(object),
                }
            }
            tracing::debug!("Observer dispatcher stopped");
        });
        Self { tx }
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        if self.tx.send(Delivery::Event(event)).is_err() {
            tracing::debug!("Observer dispatcher gone, event dropped");
        }
    }

    pub(crate) fn error(&self, error: EngineError) {
        self.emit(SyncEvent::Error(error));
    }

    pub(crate) fn deliver(&self, handler: Arc<dyn DownloadHandler>, object: DownloadedObject) {
        if self.tx.send(Delivery::Download(handler, object)).is_err() {
            tracing::debug!("Observer dispatcher gone, download dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_types::SharingGroupId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        objects: Mutex<Vec<DownloadedObject>>,
    }

    impl DownloadHandler for Recorder {
        fn object_downloaded(&self, object: DownloadedObject) {
            self.objects.lock().unwrap().push(object);
        }
    }

    #[tokio::test]
    async fn events_reach_observer_in_order() {
        let (observer, mut rx) = ChannelObserver::new();
        let notifier = Notifier::spawn(Some(Arc::new(observer)), &Handle::current());

        let target = DeletionTarget::Object(FileGroupId::new());
        notifier.emit(SyncEvent::DeletionCompleted(target));
        notifier.error(EngineError::Protocol("bad".into()));

        assert_eq!(rx.recv().await, Some(SyncEvent::DeletionCompleted(target)));
        assert_eq!(
            rx.recv().await,
            Some(SyncEvent::Error(EngineError::Protocol("bad".into())))
        );
    }

    #[tokio::test]
    async fn downloads_reach_handler_before_later_events() {
        let (observer, mut rx) = ChannelObserver::new();
        let notifier = Notifier::spawn(Some(Arc::new(observer)), &Handle::current());
        let recorder = Arc::new(Recorder::default());

        let object = DownloadedObject {
            group_id: FileGroupId::new(),
            sharing_group: SharingGroupId::new(),
            object_type: "note".into(),
            files: vec![],
        };
        notifier.deliver(recorder.clone(), object.clone());
        notifier.emit(SyncEvent::DownloadCompleted(object.clone()));

        assert_eq!(rx.recv().await, Some(SyncEvent::DownloadCompleted(object.clone())));
        assert_eq!(*recorder.objects.lock().unwrap(), vec![object]);
    }

    #[tokio::test]
    async fn no_observer_is_fine() {
        let notifier = Notifier::spawn(None, &Handle::current());
        notifier.emit(SyncEvent::Error(EngineError::Protocol("ignored".into())));
    }
}
