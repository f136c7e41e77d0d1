//! In-memory store for tests and ephemeral clients.

use super::{StoreError, SyncStore, WriteBatch, WriteOp};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredRow {
    group_key: Option<String>,
    body: Vec<u8>,
}

/// Store backed by a map. Clones share the same rows, which lets a test
/// restart a client against the state it left behind.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    rows: Arc<Mutex<BTreeMap<(String, String), StoredRow>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows of a kind.
    pub async fn count(&self, kind: &str) -> usize {
        let rows = self.rows.lock().await;
        rows.keys().filter(|(k, _)| k == kind).count()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_raw(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(kind.to_string(), key.to_string()))
            .map(|row| row.body.clone()))
    }

    async fn by_group_raw(&self, kind: &str, group_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|((k, _), row)| k == kind && row.group_key.as_deref() == Some(group_key))
            .map(|(_, row)| row.body.clone())
            .collect())
    }

    async fn all_raw(&self, kind: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|(_, row)| row.body.clone())
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        // Holding the lock for the whole batch makes it atomic for readers
        let mut rows = self.rows.lock().await;
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    kind,
                    key,
                    group_key,
                    body,
                } => {
                    rows.insert((kind.to_string(), key), StoredRow { group_key, body });
                }
                WriteOp::Delete { kind, key } => {
                    rows.remove(&(kind.to_string(), key));
                }
            }
        }
        Ok(())
    }
}
