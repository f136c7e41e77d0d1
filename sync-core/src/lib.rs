//! # sync-core
//!
//! Pure logic for objsync (no I/O, instant tests).
//!
//! This crate holds the directory model, the declared-object registry and
//! the transfer tracker state machines without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! Every function here takes rows in and hands rows and decisions back:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic selection (same rows and clock → same dispatch)
//! - One place to read each invariant
//!
//! `sync-client` interprets the results: it writes rows to the store, calls
//! the network and notifies observers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod deletion;
pub mod directory;
pub mod dispatch;
pub mod download;
pub mod registry;
pub mod tracker;
pub mod upload;

pub use conflict::FileRemap;
pub use deletion::{DeletionMarks, DeletionStatus, DeletionTarget, DeletionTracker};
pub use directory::{
    batch_kind, upsert_from_server_index, versions_of_all_files, BatchKind, DirectoryError,
    FileEntry, LabelConflict, ObjectEntry, Reconciliation, RejectedRecord, ServerDeletion,
    SharingGroupEntry,
};
pub use dispatch::{select_deletions, select_downloads, select_uploads, TransferKind};
pub use download::{
    DownloadFailure, DownloadFileTracker, DownloadObjectTracker, DownloadStatus, DownloadedFile,
    DownloadedObject, FileDownload, ObjectDownload,
};
pub use registry::{FileDeclaration, ObjectDeclaration, ObjectRegistry, Registration, RegistryError};
pub use tracker::{TrackerError, ValidationError};
pub use upload::{
    PlanRequest, PlannedFile, UploadCompletion, UploadFileTracker, UploadObjectTracker, UploadPlan,
    UploadResult, UploadStatus,
};
