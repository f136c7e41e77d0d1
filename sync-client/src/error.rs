//! Error types for sync-client.

use objsync_core::{DirectoryError, RegistryError, TrackerError, TransferKind, ValidationError};
use objsync_types::{DeferredId, FileGroupId, FileId};
use std::path::PathBuf;

use crate::network::TransportError;
use crate::storage::StoreError;

/// Errors returned to callers of [`SyncClient`](crate::SyncClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request was refused; nothing was stored.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// A declaration could not be registered.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A directory invariant was violated.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// A tracker transition was illegal.
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// The store failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The network failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An upload source could not be read.
    #[error("failed to read upload source {path}: {source}")]
    Source {
        /// The source path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The engine task is gone.
    #[error("sync engine stopped")]
    EngineStopped,
}

/// Failures reported asynchronously through the observer.
///
/// Cloneable so one event can reach several observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A network call failed; the transfer will be retried.
    #[error("{kind:?} transport error: {message}")]
    Transport {
        /// Which pipeline failed.
        kind: TransferKind,
        /// Error text.
        message: String,
    },

    /// The server index could not be fetched; the sync pass was aborted.
    #[error("index fetch failed: {0}")]
    IndexFetch(String),

    /// A download failed too often and was dropped.
    #[error("download of file {file_id} in {group_id} failed {attempts} times")]
    DownloadRetriesExhausted {
        /// The object.
        group_id: FileGroupId,
        /// The file.
        file_id: FileId,
        /// Failed attempts.
        attempts: u32,
    },

    /// The server reported an error for a deferred operation.
    #[error("deferred operation {0} failed on the server")]
    DeferredOperationFailed(DeferredId),

    /// The server does not know a deferred id it handed out.
    #[error("server does not know deferred operation {0}")]
    UnknownDeferredId(DeferredId),

    /// A queued batch no longer satisfies its invariants and was dropped.
    #[error("upload batch for {group_id} dropped: {reason}")]
    BatchDropped {
        /// The object.
        group_id: FileGroupId,
        /// Why.
        reason: String,
    },

    /// The server broke the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A server index record was not merged.
    #[error("index record for file {file_id} rejected: {message}")]
    Reconcile {
        /// The file named by the record.
        file_id: FileId,
        /// Why.
        message: String,
    },

    /// A result would have broken a directory invariant.
    #[error("directory error: {0}")]
    Directory(String),

    /// A queued request no longer passes validation.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The store failed while handling a result.
    #[error("storage error: {0}")]
    Store(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<ClientError> for EngineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Store(e) => e.into(),
            ClientError::Directory(e) => Self::Directory(e.to_string()),
            ClientError::Validation(e) => Self::Validation(e.to_string()),
            ClientError::Registry(e) => Self::Validation(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_converts() {
        let err: ClientError = ValidationError::EmptyRequest.into();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(err.to_string(), "invalid request: request names no files");
    }

    #[test]
    fn result_path_errors_keep_their_category() {
        let regression = DirectoryError::VersionRegression {
            file_id: FileId::new(),
            current: objsync_types::FileVersion::new(2),
            proposed: objsync_types::FileVersion::new(1),
        };
        let err: EngineError = ClientError::from(regression).into();
        assert!(matches!(err, EngineError::Directory(_)));

        let err: EngineError = ClientError::from(ValidationError::EmptyRequest).into();
        assert_eq!(err, EngineError::Validation("request names no files".into()));

        let err: EngineError = ClientError::EngineStopped.into();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::DeferredOperationFailed(DeferredId::new(3));
        assert_eq!(err.to_string(), "deferred operation 3 failed on the server");
    }
}
