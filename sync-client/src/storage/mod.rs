//! Persistent store for directory rows and transfer trackers.
//!
//! Every row type implements [`Row`]: a kind, a primary key and an optional
//! group key for fetch-by-group. Bodies are MessagePack with named fields so
//! rows survive added fields across versions.
//!
//! Backends implement the object-safe [`SyncStore`] over raw bytes;
//! [`Repository`] adds the typed layer the engine uses. A [`WriteBatch`] is
//! applied atomically, so a completed batch never leaves half its trackers
//! behind.

mod memory;
mod rows;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A stored row could not be decoded.
    #[error("decode error in {kind} row: {source}")]
    Decode {
        /// Row kind.
        kind: &'static str,
        /// Underlying error.
        source: rmp_serde::decode::Error,
    },
}

/// A typed, persisted row.
pub trait Row: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table discriminator.
    const KIND: &'static str;

    /// Primary key within the kind.
    fn key(&self) -> String;

    /// Secondary key used by [`Repository::by_group`].
    fn group_key(&self) -> Option<String>;
}

/// One write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace a row.
    Put {
        /// Row kind.
        kind: &'static str,
        /// Primary key.
        key: String,
        /// Secondary key.
        group_key: Option<String>,
        /// Encoded body.
        body: Vec<u8>,
    },
    /// Remove a row if present.
    Delete {
        /// Row kind.
        kind: &'static str,
        /// Primary key.
        key: String,
    },
}

/// Writes applied together or not at all.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row.
    pub fn put<R: Row>(&mut self, row: &R) -> Result<&mut Self, StoreError> {
        self.ops.push(WriteOp::Put {
            kind: R::KIND,
            key: row.key(),
            group_key: row.group_key(),
            body: rmp_serde::to_vec_named(row)?,
        });
        Ok(self)
    }

    /// Remove a row.
    pub fn delete<R: Row>(&mut self, row: &R) -> &mut Self {
        self.delete_key::<R>(row.key())
    }

    /// Remove a row by key.
    pub fn delete_key<R: Row>(&mut self, key: String) -> &mut Self {
        self.ops.push(WriteOp::Delete { kind: R::KIND, key });
        self
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing was added.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The writes in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Take the writes.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Storage backend over encoded rows.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Fetch one row body.
    async fn get_raw(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Fetch every row body of a kind with the given group key, ordered by key.
    async fn by_group_raw(&self, kind: &str, group_key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Fetch every row body of a kind, ordered by key.
    async fn all_raw(&self, kind: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Apply a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Typed access to a [`SyncStore`].
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn SyncStore>,
}

impl Repository {
    /// Wrap a backend.
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    fn decode<R: Row>(body: &[u8]) -> Result<R, StoreError> {
        rmp_serde::from_slice(body).map_err(|source| StoreError::Decode {
            kind: R::KIND,
            source,
        })
    }

    /// Fetch a row by key.
    pub async fn get<R: Row>(&self, key: &str) -> Result<Option<R>, StoreError> {
        match self.store.get_raw(R::KIND, key).await? {
            Some(body) => Ok(Some(Self::decode(&body)?)),
            None => Ok(None),
        }
    }

    /// Fetch every row with the given group key.
    pub async fn by_group<R: Row>(&self, group_key: &str) -> Result<Vec<R>, StoreError> {
        self.store
            .by_group_raw(R::KIND, group_key)
            .await?
            .iter()
            .map(|body| Self::decode(body))
            .collect()
    }

    /// Fetch every row of a kind.
    pub async fn all<R: Row>(&self) -> Result<Vec<R>, StoreError> {
        self.store
            .all_raw(R::KIND)
            .await?
            .iter()
            .map(|body| Self::decode(body))
            .collect()
    }

    /// Apply a batch atomically. Empty batches are skipped.
    pub async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_core::{FileEntry, ObjectEntry};
    use objsync_types::{FileGroupId, FileId, SharingGroupId};

    async fn exercise(repo: Repository) {
        let object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");
        let a = FileEntry::new_local(FileId::new(), object.group_id, "body", "text/plain");
        let b = FileEntry::new_local(FileId::new(), object.group_id, "image", "image/png");
        let other = FileEntry::new_local(FileId::new(), FileGroupId::new(), "body", "text/plain");

        let mut batch = WriteBatch::new();
        batch.put(&object).unwrap();
        batch.put(&a).unwrap().put(&b).unwrap().put(&other).unwrap();
        repo.commit(batch).await.unwrap();

        let fetched: ObjectEntry = repo.get(&object.group_id.to_string()).await.unwrap().unwrap();
        assert_eq!(fetched, object);

        let group: Vec<FileEntry> = repo.by_group(&object.group_id.to_string()).await.unwrap();
        assert_eq!(group.len(), 2);
        assert!(group.contains(&a) && group.contains(&b));

        let all: Vec<FileEntry> = repo.all().await.unwrap();
        assert_eq!(all.len(), 3);

        // Replace and delete in one batch
        let mut updated = a.clone();
        updated.mark_deleted_locally();
        let mut batch = WriteBatch::new();
        batch.put(&updated).unwrap();
        batch.delete(&b);
        repo.commit(batch).await.unwrap();

        let group: Vec<FileEntry> = repo.by_group(&object.group_id.to_string()).await.unwrap();
        assert_eq!(group, vec![updated]);
        assert!(repo
            .get::<FileEntry>(&b.file_id.to_string())
            .await
            .unwrap()
            .is_none());

        // Deleting a missing row is fine
        let mut batch = WriteBatch::new();
        batch.delete(&b);
        repo.commit(batch).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise(Repository::new(Arc::new(MemoryStore::new()))).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        exercise(Repository::new(Arc::new(store))).await;
    }

    #[tokio::test]
    async fn sqlite_store_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objsync.db");
        let object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");

        {
            let repo = Repository::new(Arc::new(SqliteStore::open(&path).await.unwrap()));
            let mut batch = WriteBatch::new();
            batch.put(&object).unwrap();
            repo.commit(batch).await.unwrap();
        }

        let repo = Repository::new(Arc::new(SqliteStore::open(&path).await.unwrap()));
        let all: Vec<ObjectEntry> = repo.all().await.unwrap();
        assert_eq!(all, vec![object]);
    }

    #[test]
    fn batch_records_ops() {
        let object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());
        batch.put(&object).unwrap();
        batch.delete(&object);
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], WriteOp::Put { kind: "object", .. }));
        assert!(matches!(batch.ops()[1], WriteOp::Delete { kind: "object", .. }));
    }
}
