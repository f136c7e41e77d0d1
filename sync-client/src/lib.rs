//! # sync-client
//!
//! Client sync engine for objsync.
//!
//! Apps declare object types, queue uploads, downloads and deletions, and
//! call `sync()` to merge the server index. The engine persists every
//! queued transfer, drives it over a pluggable [`Networking`] collaborator,
//! and reports outcomes to a [`SyncObserver`].
//!
//! ## Features
//!
//! - **Durable queues**: trackers live in a [`SyncStore`] (SQLite or memory) and resume after restart
//! - **Deferred completion**: versioned uploads and deletions are polled until the server applies them
//! - **Conflict handling**: first uploads that lose to another device are remapped to the server's id
//! - **Pure decisions**: validation and dispatch order come from sync-core
//!
//! ## Example
//!
//! ```ignore
//! use objsync_client::{ChannelObserver, SqliteStore, SyncClient};
//!
//! let store = SqliteStore::open(&path).await?;
//! let (observer, mut events) = ChannelObserver::new();
//! let client = SyncClient::builder(Arc::new(store), Arc::new(network))
//!     .observer(Arc::new(observer))
//!     .start()
//!     .await?;
//!
//! client.sync(IndexScope::All).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod client;
pub mod config;
mod engine;
pub mod error;
pub mod network;
pub mod observer;
mod poller;
pub mod storage;

pub use client::{FileUpload, ObjectUpload, SyncClient, SyncClientBuilder};
pub use config::{ConfigError, EngineConfig};
pub use engine::{DownloadSnapshot, PendingLocalDeletion, PendingTransfers, UploadSnapshot};
pub use error::{ClientError, EngineError};
pub use network::{
    DeletionRequest, DownloadRequest, MockNetworking, Networking, TransportError, UploadRequest,
};
pub use observer::{ChannelObserver, DownloadHandler, SyncEvent, SyncObserver, SyncSummary};
pub use storage::{MemoryStore, Repository, Row, SqliteStore, StoreError, SyncStore, WriteBatch, WriteOp};
