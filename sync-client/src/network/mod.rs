//! Networking collaborator contract.
//!
//! The engine never talks HTTP itself. It hands fully described requests to
//! a [`Networking`] implementation and consumes the result shapes from
//! `objsync-types`. Each call returns exactly once; retries and timeouts
//! below that level are the implementation's business.
//!
//! # Example
//!
//! ```ignore
//! let network = MockNetworking::new();
//! let client = SyncClient::builder(store, Arc::new(network.clone())).start().await?;
//! ```

mod mock;

pub use mock::MockNetworking;

use async_trait::async_trait;
use objsync_core::DeletionTarget;
use objsync_types::{
    BatchId, DeferredId, DeferredStatus, DeletionOutcome, DownloadOutcome, FileGroupId, FileId,
    FileVersion, IndexScope, ServerIndex, SharingGroupId, UploadOutcome,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Transport errors.
///
/// Cloneable so a failure can be reported and recorded at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with an error status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Error text from the server.
        message: String,
    },

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One file of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// The file.
    pub file_id: FileId,
    /// The object.
    pub group_id: FileGroupId,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
    /// Declared object type.
    pub object_type: String,
    /// Label of the file.
    pub file_label: String,
    /// MIME type of the bytes.
    pub mime_type: String,
    /// Batch the file belongs to.
    pub batch_id: BatchId,
    /// Seconds the server should keep an unfinished batch.
    pub batch_expiry_secs: u64,
    /// 1-based position in the batch.
    pub upload_index: u32,
    /// Number of files in the batch.
    pub upload_count: u32,
    /// Version being created.
    pub version: FileVersion,
    /// Hex SHA-256 of the source.
    pub checksum: String,
    /// Local file holding the bytes.
    pub source: PathBuf,
}

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// The file.
    pub file_id: FileId,
    /// The object.
    pub group_id: FileGroupId,
    /// Label of the file.
    pub file_label: String,
    /// Version to fetch.
    pub version: FileVersion,
}

/// A deletion to apply on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    /// What to delete.
    pub target: DeletionTarget,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
}

/// Server operations the engine depends on.
#[async_trait]
pub trait Networking: Send + Sync + 'static {
    /// Upload one file of a batch.
    async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, TransportError>;

    /// Download one file version.
    async fn download(&self, request: DownloadRequest) -> Result<DownloadOutcome, TransportError>;

    /// Delete an object or file.
    async fn delete(&self, request: DeletionRequest) -> Result<DeletionOutcome, TransportError>;

    /// Ask where a deferred operation stands.
    async fn query_deferred_status(&self, id: DeferredId) -> Result<DeferredStatus, TransportError>;

    /// Fetch the server index for a scope.
    async fn fetch_index(&self, scope: IndexScope) -> Result<ServerIndex, TransportError>;

    /// Notify the other members of a sharing group.
    async fn send_push_notification(
        &self,
        sharing_group: SharingGroupId,
        message: String,
    ) -> Result<(), TransportError>;
}
