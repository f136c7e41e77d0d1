//! The sync engine actor.
//!
//! One task owns the store handle, the registry and the poller. Caller
//! requests arrive as [`Command`]s over a bounded channel; network results
//! come back over an unbounded channel the engine owns. Both are handled
//! one at a time, so every state change is serialized.
//!
//! ```text
//! SyncClient ──Command──▶ Engine ──spawn──▶ Networking
//!                           ▲                   │
//!                           └────result─────────┘
//! ```

mod deletions;
mod downloads;
mod queries;
mod sync;
mod uploads;

pub use queries::{DownloadSnapshot, PendingLocalDeletion, PendingTransfers, UploadSnapshot};

use objsync_core::{
    DeletionTarget, DeletionTracker, DeletionStatus, FileDownload, ObjectDeclaration,
    ObjectDownload, ObjectRegistry, PlanRequest, Registration, UploadObjectTracker,
};
use objsync_types::{
    DeferredId, DeferredStatus, DeletionOutcome, DownloadOutcome, FileGroupId, IndexScope,
    ServerIndex, TrackerId, UploadOutcome,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::error::{ClientError, EngineError};
use crate::network::{Networking, TransportError};
use crate::observer::{DownloadHandler, Notifier, SyncSummary};
use crate::poller::DeferredPoller;
use crate::storage::{Repository, StoreError, WriteBatch};

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Which tracker a deferred status query is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Waiter {
    Upload(TrackerId),
    Deletion(TrackerId),
}

/// Read-only requests.
pub(crate) enum Query {
    NeedingDownload(Reply<Vec<ObjectDownload>>),
    NeedingLocalDeletion(Reply<Vec<PendingLocalDeletion>>),
    SharingGroups(Reply<Vec<objsync_core::SharingGroupEntry>>),
    Object(FileGroupId, Reply<Option<objsync_core::ObjectEntry>>),
    Files(FileGroupId, Reply<Vec<objsync_core::FileEntry>>),
    Declarations(Reply<Vec<ObjectDeclaration>>),
    PendingTransfers(Reply<PendingTransfers>),
}

/// Everything the engine reacts to.
pub(crate) enum Command {
    Register {
        declaration: ObjectDeclaration,
        handler: Option<Arc<dyn DownloadHandler>>,
        reply: Reply<Registration>,
    },
    QueueUpload {
        request: PlanRequest,
        reply: Reply<TrackerId>,
    },
    QueueDownload {
        request: ObjectDownload,
        reply: Reply<TrackerId>,
    },
    QueueDownloadLatest {
        group_id: FileGroupId,
        reply: Reply<TrackerId>,
    },
    QueueDeletion {
        target: DeletionTarget,
        reply: Reply<TrackerId>,
    },
    Sync {
        scope: IndexScope,
        reply: Reply<SyncSummary>,
    },
    MarkAsDownloaded {
        files: Vec<FileDownload>,
        reply: Reply<()>,
    },
    MarkLocalDeletionHandled {
        target: DeletionTarget,
        reply: Reply<()>,
    },
    PollDeferred {
        reply: Option<Reply<usize>>,
    },
    Query(Query),
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    // Results of spawned network calls
    IndexFetched {
        scope: IndexScope,
        result: Result<ServerIndex, TransportError>,
        reply: Reply<SyncSummary>,
    },
    UploadFinished {
        tracker: TrackerId,
        result: Result<UploadOutcome, TransportError>,
    },
    DownloadFinished {
        tracker: TrackerId,
        result: Result<DownloadOutcome, TransportError>,
    },
    DeletionFinished {
        tracker: TrackerId,
        result: Result<DeletionOutcome, TransportError>,
    },
    DeferredStatus {
        waiter: Waiter,
        deferred_id: DeferredId,
        result: Result<DeferredStatus, TransportError>,
    },
    PushSent {
        result: Result<(), TransportError>,
    },
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) struct Engine {
    repo: Repository,
    network: Arc<dyn Networking>,
    config: EngineConfig,
    registry: ObjectRegistry,
    handlers: HashMap<String, Arc<dyn DownloadHandler>>,
    notifier: Notifier,
    results: mpsc::UnboundedSender<Command>,
    poller: Option<DeferredPoller>,
    querying: HashSet<Waiter>,
    in_flight: usize,
    idle_waiters: Vec<oneshot::Sender<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    next_seq: u64,
}

impl Engine {
    pub(crate) fn new(
        repo: Repository,
        network: Arc<dyn Networking>,
        config: EngineConfig,
        registry: ObjectRegistry,
        notifier: Notifier,
        results: mpsc::UnboundedSender<Command>,
        next_seq: u64,
    ) -> Self {
        Self {
            repo,
            network,
            config,
            registry,
            handlers: HashMap::new(),
            notifier,
            results,
            poller: None,
            querying: HashSet::new(),
            in_flight: 0,
            idle_waiters: Vec::new(),
            shutdown: None,
            next_seq,
        }
    }

    /// Main loop. Ends after shutdown or once every client handle is gone,
    /// in both cases only when no network call is outstanding.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut results: mpsc::UnboundedReceiver<Command>,
    ) {
        tracing::info!("Sync engine started");

        if let Err(e) = self.refresh_poller().await {
            tracing::error!("Failed to read deferred trackers: {}", e);
            self.notifier.error(e.into());
        }

        let mut accepting = true;
        loop {
            tokio::select! {
                biased;
                Some(command) = results.recv() => self.handle(command).await,
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.handle(command).await,
                    None => accepting = false,
                },
            }

            if self.shutdown.is_some() {
                accepting = false;
            }
            if !accepting && self.in_flight == 0 {
                break;
            }
        }

        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(());
        }
        tracing::info!("Sync engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                declaration,
                handler,
                reply,
            } => {
                let result = self.register(declaration, handler).await;
                let _ = reply.send(result);
            }
            Command::QueueUpload { request, reply } => {
                let result = self.queue_upload(request).await;
                let _ = reply.send(result);
            }
            Command::QueueDownload { request, reply } => {
                let result = self.queue_download(request).await;
                let _ = reply.send(result);
            }
            Command::QueueDownloadLatest { group_id, reply } => {
                let result = self.queue_download_latest(group_id).await;
                let _ = reply.send(result);
            }
            Command::QueueDeletion { target, reply } => {
                let result = self.queue_deletion(target).await;
                let _ = reply.send(result);
            }
            Command::Sync { scope, reply } => self.start_sync(scope, reply),
            Command::MarkAsDownloaded { files, reply } => {
                let result = self.mark_as_downloaded(files).await;
                let _ = reply.send(result);
            }
            Command::MarkLocalDeletionHandled { target, reply } => {
                let result = self.mark_local_deletion_handled(target).await;
                let _ = reply.send(result);
            }
            Command::PollDeferred { reply } => {
                let result = self.poll_pass().await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => self.report(result),
                }
            }
            Command::Query(query) => self.query(query).await,
            Command::WaitIdle { reply } => {
                if self.in_flight == 0 {
                    let _ = reply.send(());
                } else {
                    self.idle_waiters.push(reply);
                }
            }
            Command::Shutdown { reply } => {
                tracing::info!("Sync engine shutting down ({} calls in flight)", self.in_flight);
                self.shutdown = Some(reply);
            }

            Command::IndexFetched {
                scope,
                result,
                reply,
            } => {
                self.call_returned();
                let outcome = self.on_index_fetched(scope, result).await;
                let _ = reply.send(outcome);
                self.wake_idle();
            }
            Command::UploadFinished { tracker, result } => {
                self.call_returned();
                let outcome = self.on_upload_finished(tracker, result).await;
                self.report(outcome);
                self.wake_idle();
            }
            Command::DownloadFinished { tracker, result } => {
                self.call_returned();
                let outcome = self.on_download_finished(tracker, result).await;
                self.report(outcome);
                self.wake_idle();
            }
            Command::DeletionFinished { tracker, result } => {
                self.call_returned();
                let outcome = self.on_deletion_finished(tracker, result).await;
                self.report(outcome);
                self.wake_idle();
            }
            Command::DeferredStatus {
                waiter,
                deferred_id,
                result,
            } => {
                self.call_returned();
                let outcome = self.on_deferred_status(waiter, deferred_id, result).await;
                self.report(outcome);
                self.wake_idle();
            }
            Command::PushSent { result } => {
                self.call_returned();
                if let Err(e) = result {
                    tracing::warn!("Push notification failed: {}", e);
                }
                self.wake_idle();
            }
        }
    }

    async fn register(
        &mut self,
        declaration: ObjectDeclaration,
        handler: Option<Arc<dyn DownloadHandler>>,
    ) -> Result<Registration, ClientError> {
        let object_type = declaration.object_type.clone();
        let mut candidate = self.registry.clone();
        let registration = candidate.register(declaration)?;

        if registration != Registration::Unchanged {
            if let Some(stored) = candidate.declaration(&object_type) {
                let mut batch = WriteBatch::new();
                batch.put(stored)?;
                self.repo.commit(batch).await?;
            }
        }
        self.registry = candidate;

        if let Some(handler) = handler {
            self.handlers.insert(object_type.clone(), handler);
        }
        tracing::info!("Registered object type {} ({:?})", object_type, registration);
        Ok(registration)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Spawn a network call. The future must produce exactly one result
    /// command.
    fn spawn_call<F>(&mut self, call: F)
    where
        F: Future<Output = Command> + Send + 'static,
    {
        self.in_flight += 1;
        let results = self.results.clone();
        tokio::spawn(async move {
            let command = call.await;
            // Fails only once the engine is gone
            let _ = results.send(command);
        });
    }

    fn call_returned(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn wake_idle(&mut self) {
        if self.in_flight == 0 {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Surface a failure that has no caller to return to.
    fn report<T>(&self, result: Result<T, ClientError>) {
        if let Err(e) = result {
            tracing::error!("Engine error: {}", e);
            self.notifier.error(EngineError::from(e));
        }
    }

    fn send_push(&mut self, sharing_group: objsync_types::SharingGroupId, message: String) {
        let network = Arc::clone(&self.network);
        self.spawn_call(async move {
            Command::PushSent {
                result: network.send_push_notification(sharing_group, message).await,
            }
        });
    }

    /// Any tracker waiting on a deferred operation?
    async fn has_waiting(&self) -> Result<bool, StoreError> {
        let uploads: Vec<UploadObjectTracker> = self.repo.all().await?;
        if uploads.iter().any(|o| o.deferred_id.is_some()) {
            return Ok(true);
        }
        let deletions: Vec<DeletionTracker> = self.repo.all().await?;
        Ok(deletions
            .iter()
            .any(|d| d.status == DeletionStatus::WaitingForDeferredDeletion))
    }

    /// Start the poller when something waits, stop it when nothing does.
    async fn refresh_poller(&mut self) -> Result<(), StoreError> {
        let waiting = self.has_waiting().await?;
        match (waiting, self.poller.is_some()) {
            (true, false) => {
                let results = self.results.clone();
                self.poller = Some(DeferredPoller::start(
                    self.config.deferred_poll_interval(),
                    move || results.send(Command::PollDeferred { reply: None }).is_ok(),
                ));
            }
            (false, true) => {
                if let Some(poller) = self.poller.take() {
                    poller.stop();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MockNetworking;
    use crate::observer::{ChannelObserver, SyncEvent, SyncObserver};
    use crate::storage::MemoryStore;
    use objsync_core::{FileDeclaration, PlannedFile, UploadFileTracker};
    use objsync_types::{FileId, SharingGroupId, UploadFinished};
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::time::timeout;

    struct Rig {
        engine: Engine,
        results: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedReceiver<SyncEvent>,
    }

    impl Rig {
        fn new() -> Self {
            let declaration = ObjectDeclaration::new("note")
                .with_file(FileDeclaration::new("body", "text/plain").with_change_resolver("replace"));
            let (observer, events) = ChannelObserver::new();
            let observer: Arc<dyn SyncObserver> = Arc::new(observer);
            let notifier = Notifier::spawn(Some(observer), &Handle::current());
            let (results_tx, results) = mpsc::unbounded_channel();
            let engine = Engine::new(
                Repository::new(Arc::new(MemoryStore::new())),
                Arc::new(MockNetworking::new()),
                EngineConfig::default(),
                ObjectRegistry::from_declarations([declaration]),
                notifier,
                results_tx,
                0,
            );
            Self {
                engine,
                results,
                events,
            }
        }

        /// Feed network results back until nothing is in flight.
        async fn drain(&mut self) {
            while self.engine.in_flight > 0 {
                let command = self.results.recv().await.unwrap();
                self.engine.handle(command).await;
            }
        }

        async fn queue(&mut self, group_id: FileGroupId, sharing_group: SharingGroupId, file_id: FileId) {
            let request = PlanRequest {
                object_type: "note".into(),
                group_id,
                sharing_group,
                files: vec![PlannedFile {
                    file_id,
                    file_label: "body".into(),
                    mime_type: "text/plain".into(),
                    source: "/tmp/body".into(),
                    checksum: "00".into(),
                }],
                push_notification: None,
            };
            let (reply, rx) = oneshot::channel();
            self.engine.handle(Command::QueueUpload { request, reply }).await;
            rx.await.unwrap().unwrap();
            self.drain().await;
        }

        async fn events(&mut self) -> Vec<SyncEvent> {
            let mut events = Vec::new();
            while let Ok(Some(event)) = timeout(Duration::from_millis(200), self.events.recv()).await {
                events.push(event);
            }
            events
        }
    }

    // ===========================================
    // Replayed results
    // ===========================================

    #[tokio::test]
    async fn repeated_completion_finalizes_once() {
        let mut rig = Rig::new();
        let (group, sharing_group, file) = (FileGroupId::new(), SharingGroupId::new(), FileId::new());
        rig.queue(group, sharing_group, file).await;
        rig.events().await;

        rig.queue(group, sharing_group, file).await;
        let objects: Vec<UploadObjectTracker> = rig.engine.repo.all().await.unwrap();
        let files: Vec<UploadFileTracker> = rig.engine.repo.all().await.unwrap();
        assert_eq!(objects.len(), 1);
        let deferred_id = objects[0].deferred_id.unwrap();
        let waiter = Waiter::Upload(objects[0].id);

        for _ in 0..2 {
            rig.engine.in_flight += 1;
            rig.engine
                .handle(Command::DeferredStatus {
                    waiter,
                    deferred_id,
                    result: Ok(DeferredStatus::Completed),
                })
                .await;
        }
        // A late copy of the upload answer for the finished batch
        rig.engine.in_flight += 1;
        rig.engine
            .handle(Command::UploadFinished {
                tracker: files[0].id,
                result: Ok(UploadOutcome::Success {
                    finished: UploadFinished::VNTransferPending,
                    deferred_id: Some(deferred_id),
                }),
            })
            .await;

        let events = rig.events().await;
        let deferred = events
            .iter()
            .filter(|e| matches!(e, SyncEvent::DeferredCompleted { .. }))
            .count();
        let completed = events
            .iter()
            .filter(|e| matches!(e, SyncEvent::UploadCompleted { v0: false, .. }))
            .count();
        assert_eq!(deferred, 1);
        assert_eq!(completed, 1);
        assert!(!events.iter().any(|e| matches!(e, SyncEvent::Error(_))));

        let remaining: Vec<UploadObjectTracker> = rig.engine.repo.all().await.unwrap();
        assert!(remaining.is_empty());
        assert_eq!(rig.engine.in_flight, 0);
    }
}
