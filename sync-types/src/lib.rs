//! # sync-types
//!
//! Foundational types for the objsync client sync engine.
//!
//! This crate provides the types shared by every objsync crate:
//! - [`FileGroupId`], [`FileId`], [`SharingGroupId`], [`TrackerId`], [`BatchId`] - identity types
//! - [`FileVersion`], [`DeferredId`] - server-assigned ordering and job handles
//! - [`FileRecord`], [`ServerIndex`] and the transfer outcome enums - the
//!   minimal shapes the engine reads from server responses
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;

pub use error::SyncError;
pub use ids::{BatchId, DeferredId, FileGroupId, FileId, FileVersion, SharingGroupId, TrackerId};
pub use messages::{
    DeferredStatus, DeletionOutcome, DownloadOutcome, FileRecord, GoneReason, IndexScope,
    ServerIndex, SharingGroupRecord, UploadFinished, UploadOutcome,
};
