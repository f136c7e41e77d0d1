//! SyncClient - the main interface for objsync.
//!
//! [`SyncClient`] is a cheap, cloneable handle onto the engine task. Every
//! method sends one command and waits for the reply; transfers run in the
//! background and report through the [`SyncObserver`].
//!
//! # Architecture
//!
//! ```text
//! Application → SyncClient ──Command──▶ Engine → Networking
//!                                          ↓
//!                            sync-core (pure decisions) + SyncStore
//! ```
//!
//! # Example
//!
//! ```ignore
//! use objsync_client::{MockNetworking, MemoryStore, SyncClient};
//!
//! let client = SyncClient::builder(Arc::new(MemoryStore::new()), Arc::new(MockNetworking::new()))
//!     .start()
//!     .await?;
//!
//! client.register(ObjectDeclaration::new("note").with_file(FileDeclaration::new("body", "text/plain"))).await?;
//! client.queue_upload(upload).await?;
//! client.sync(IndexScope::All).await?;
//! ```

use objsync_core::{
    DeletionTarget, FileDownload, FileEntry, ObjectDeclaration, ObjectDownload, ObjectEntry,
    ObjectRegistry, PlanRequest, PlannedFile, Registration, SharingGroupEntry,
};
use objsync_core::{DeletionTracker, DownloadObjectTracker, UploadObjectTracker};
use objsync_types::{FileGroupId, FileId, IndexScope, SharingGroupId, TrackerId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::checksum::file_checksum;
use crate::config::EngineConfig;
use crate::engine::{Command, Engine, PendingLocalDeletion, PendingTransfers, Query};
use crate::error::ClientError;
use crate::network::Networking;
use crate::observer::{DownloadHandler, Notifier, SyncObserver, SyncSummary};
use crate::storage::{Repository, StoreError, SyncStore};

/// One file of an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// The file. A new id creates a file; a known id uploads a change.
    pub file_id: FileId,
    /// Declared label of the file.
    pub file_label: String,
    /// MIME type of the bytes.
    pub mime_type: String,
    /// Local file holding the bytes. Must exist until the upload finishes.
    pub source: PathBuf,
}

impl FileUpload {
    /// Describe one file to upload.
    pub fn new(file_id: FileId, file_label: &str, mime_type: &str, source: impl Into<PathBuf>) -> Self {
        Self {
            file_id,
            file_label: file_label.to_string(),
            mime_type: mime_type.to_string(),
            source: source.into(),
        }
    }
}

/// An upload request for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUpload {
    /// Declared object type.
    pub object_type: String,
    /// The object.
    pub group_id: FileGroupId,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
    /// Files in this batch. All new or all existing.
    pub files: Vec<FileUpload>,
    /// Push notification sent once the batch is on the server.
    pub push_notification: Option<String>,
}

impl ObjectUpload {
    /// Start an upload request with no files.
    pub fn new(object_type: &str, group_id: FileGroupId, sharing_group: SharingGroupId) -> Self {
        Self {
            object_type: object_type.to_string(),
            group_id,
            sharing_group,
            files: Vec::new(),
            push_notification: None,
        }
    }

    /// Add a file.
    pub fn with_file(mut self, file: FileUpload) -> Self {
        self.files.push(file);
        self
    }

    /// Send a push notification when the batch is done.
    pub fn with_push_notification(mut self, message: &str) -> Self {
        self.push_notification = Some(message.to_string());
        self
    }
}

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder {
    store: Arc<dyn SyncStore>,
    network: Arc<dyn Networking>,
    config: EngineConfig,
    observer: Option<Arc<dyn SyncObserver>>,
    observer_runtime: Option<Handle>,
}

impl SyncClientBuilder {
    /// Use a configuration other than the default.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive engine events.
    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run observer and download handler callbacks on this runtime instead
    /// of the current one.
    pub fn observer_runtime(mut self, runtime: Handle) -> Self {
        self.observer_runtime = Some(runtime);
        self
    }

    /// Load persisted state and spawn the engine on the current runtime.
    ///
    /// Trackers left by a previous run resume where they stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn start(self) -> Result<SyncClient, ClientError> {
        let repo = Repository::new(self.store);

        let declarations: Vec<ObjectDeclaration> = repo.all().await?;
        let registry = ObjectRegistry::from_declarations(declarations);
        let next_seq = next_seq(&repo).await?;

        let runtime = self.observer_runtime.unwrap_or_else(Handle::current);
        let notifier = Notifier::spawn(self.observer, &runtime);

        let (tx, commands) = mpsc::channel(self.config.command_buffer.max(1));
        let (results_tx, results) = mpsc::unbounded_channel();
        tracing::info!(
            "Starting sync engine ({} object types, next seq {})",
            registry.len(),
            next_seq
        );
        let engine = Engine::new(repo, self.network, self.config, registry, notifier, results_tx, next_seq);
        tokio::spawn(engine.run(commands, results));

        Ok(SyncClient { tx })
    }
}

/// One past the highest queue position in the store.
async fn next_seq(repo: &Repository) -> Result<u64, StoreError> {
    let uploads: Vec<UploadObjectTracker> = repo.all().await?;
    let downloads: Vec<DownloadObjectTracker> = repo.all().await?;
    let deletions: Vec<DeletionTracker> = repo.all().await?;
    let highest = uploads
        .iter()
        .map(|t| t.created_seq)
        .chain(downloads.iter().map(|t| t.created_seq))
        .chain(deletions.iter().map(|t| t.created_seq))
        .max();
    Ok(highest.map_or(0, |seq| seq + 1))
}

/// Handle onto a running sync engine.
///
/// Clones share the engine. It stops after [`shutdown`](Self::shutdown) or
/// once every handle is dropped and no network call is outstanding.
#[derive(Clone)]
pub struct SyncClient {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}

impl SyncClient {
    /// Configure a client over a store and a server connection.
    pub fn builder(store: Arc<dyn SyncStore>, network: Arc<dyn Networking>) -> SyncClientBuilder {
        SyncClientBuilder {
            store,
            network,
            config: EngineConfig::default(),
            observer: None,
            observer_runtime: None,
        }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        rx.await.map_err(|_| ClientError::EngineStopped)?
    }

    async fn query<T>(
        &self,
        query: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Query,
    ) -> Result<T, ClientError> {
        self.call(|reply| Command::Query(query(reply))).await
    }

    // ===========================================
    // Declarations
    // ===========================================

    /// Register an object type.
    ///
    /// Registering the same declaration again is a no-op. A new declaration
    /// may only add labels to an existing one.
    pub async fn register(&self, declaration: ObjectDeclaration) -> Result<Registration, ClientError> {
        self.call(|reply| Command::Register {
            declaration,
            handler: None,
            reply,
        })
        .await
    }

    /// Register an object type and the handler receiving its downloads.
    pub async fn register_with_handler(
        &self,
        declaration: ObjectDeclaration,
        handler: Arc<dyn DownloadHandler>,
    ) -> Result<Registration, ClientError> {
        self.call(|reply| Command::Register {
            declaration,
            handler: Some(handler),
            reply,
        })
        .await
    }

    // ===========================================
    // Queueing
    // ===========================================

    /// Queue an upload batch and return its tracker id.
    ///
    /// Sources are checksummed here; a missing source fails the request
    /// before anything is stored.
    pub async fn queue_upload(&self, upload: ObjectUpload) -> Result<TrackerId, ClientError> {
        let mut files = Vec::with_capacity(upload.files.len());
        for file in upload.files {
            let checksum = file_checksum(&file.source)
                .await
                .map_err(|source| ClientError::Source {
                    path: file.source.clone(),
                    source,
                })?;
            files.push(PlannedFile {
                file_id: file.file_id,
                file_label: file.file_label,
                mime_type: file.mime_type,
                source: file.source,
                checksum,
            });
        }
        let request = PlanRequest {
            object_type: upload.object_type,
            group_id: upload.group_id,
            sharing_group: upload.sharing_group,
            files,
            push_notification: upload.push_notification,
        };
        self.call(|reply| Command::QueueUpload { request, reply }).await
    }

    /// Queue a download of specific file versions.
    pub async fn queue_download(&self, request: ObjectDownload) -> Result<TrackerId, ClientError> {
        self.call(|reply| Command::QueueDownload { request, reply }).await
    }

    /// Queue a download of every file of the object with a newer server
    /// version.
    pub async fn queue_download_latest(&self, group_id: FileGroupId) -> Result<TrackerId, ClientError> {
        self.call(|reply| Command::QueueDownloadLatest { group_id, reply })
            .await
    }

    /// Queue a deletion of an object or one of its files.
    pub async fn queue_deletion(&self, target: DeletionTarget) -> Result<TrackerId, ClientError> {
        self.call(|reply| Command::QueueDeletion { target, reply }).await
    }

    // ===========================================
    // Sync
    // ===========================================

    /// Fetch the server index, merge it, and start whatever transfers can
    /// run.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the index cannot be fetched; nothing
    /// is changed in that case.
    pub async fn sync(&self, scope: IndexScope) -> Result<SyncSummary, ClientError> {
        self.call(|reply| Command::Sync { scope, reply }).await
    }

    /// Query every deferred operation now instead of waiting for the
    /// poller. Returns the number of queries sent.
    pub async fn poll_deferred(&self) -> Result<usize, ClientError> {
        self.call(|reply| Command::PollDeferred { reply: Some(reply) })
            .await
    }

    /// Record versions the app fetched itself.
    pub async fn mark_as_downloaded(&self, files: Vec<FileDownload>) -> Result<(), ClientError> {
        self.call(|reply| Command::MarkAsDownloaded { files, reply }).await
    }

    /// Record that the app removed its copy of something the server
    /// deleted.
    pub async fn mark_local_deletion_handled(&self, target: DeletionTarget) -> Result<(), ClientError> {
        self.call(|reply| Command::MarkLocalDeletionHandled { target, reply })
            .await
    }

    // ===========================================
    // Queries
    // ===========================================

    /// Files with a newer server version that nothing is downloading.
    pub async fn objects_needing_download(&self) -> Result<Vec<ObjectDownload>, ClientError> {
        self.query(Query::NeedingDownload).await
    }

    /// Server deletions the app has not handled yet.
    pub async fn objects_needing_local_deletion(&self) -> Result<Vec<PendingLocalDeletion>, ClientError> {
        self.query(Query::NeedingLocalDeletion).await
    }

    /// Sharing groups from the last index fetch.
    pub async fn sharing_groups(&self) -> Result<Vec<SharingGroupEntry>, ClientError> {
        self.query(Query::SharingGroups).await
    }

    /// The stored object row.
    pub async fn object(&self, group_id: FileGroupId) -> Result<Option<ObjectEntry>, ClientError> {
        self.query(|reply| Query::Object(group_id, reply)).await
    }

    /// The stored file rows of an object.
    pub async fn files(&self, group_id: FileGroupId) -> Result<Vec<FileEntry>, ClientError> {
        self.query(|reply| Query::Files(group_id, reply)).await
    }

    /// Registered declarations.
    pub async fn declarations(&self) -> Result<Vec<ObjectDeclaration>, ClientError> {
        self.query(Query::Declarations).await
    }

    /// Every queued or in-flight transfer.
    pub async fn pending_transfers(&self) -> Result<PendingTransfers, ClientError> {
        self.query(Query::PendingTransfers).await
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    /// Wait until no network call is outstanding.
    pub async fn wait_idle(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::WaitIdle { reply })
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    /// Stop accepting requests and wait for outstanding calls to finish.
    ///
    /// Queued transfers stay in the store and resume on the next start.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }
}
