//! SQLite storage backend.

use super::{StoreError, SyncStore, WriteBatch, WriteOp};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-based row store.
///
/// Uses WAL mode for concurrent reads/writes. All rows share one table keyed
/// by `(kind, key)`.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a database file, creating it if it doesn't exist.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open the database read-only. Used by inspection tools.
    pub async fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // One connection that never closes; each connection would get its
        // own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rows (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                group_key TEXT,
                body BLOB NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (kind, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rows_kind_group ON rows(kind, group_key)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Row counts per kind.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT kind, COUNT(*) FROM rows GROUP BY kind ORDER BY kind",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn get_raw(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let body = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT body FROM rows WHERE kind = ?1 AND key = ?2",
        )
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(body)
    }

    async fn by_group_raw(&self, kind: &str, group_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let bodies = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT body FROM rows WHERE kind = ?1 AND group_key = ?2 ORDER BY key",
        )
        .bind(kind)
        .bind(group_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(bodies)
    }

    async fn all_raw(&self, kind: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let bodies =
            sqlx::query_scalar::<_, Vec<u8>>("SELECT body FROM rows WHERE kind = ?1 ORDER BY key")
                .bind(kind)
                .fetch_all(&self.pool)
                .await?;
        Ok(bodies)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    kind,
                    key,
                    group_key,
                    body,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO rows (kind, key, group_key, body, updated_at)
                        VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))
                        ON CONFLICT(kind, key) DO UPDATE SET
                            group_key = excluded.group_key,
                            body = excluded.body,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(kind)
                    .bind(key)
                    .bind(group_key)
                    .bind(body)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Delete { kind, key } => {
                    sqlx::query("DELETE FROM rows WHERE kind = ?1 AND key = ?2")
                        .bind(kind)
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_core::{FileEntry, ObjectEntry};
    use objsync_types::{FileGroupId, FileId, SharingGroupId};

    #[tokio::test]
    async fn counts_by_kind() {
        let store = SqliteStore::in_memory().await.unwrap();
        let object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");
        let mut batch = WriteBatch::new();
        batch.put(&object).unwrap();
        batch
            .put(&FileEntry::new_local(FileId::new(), object.group_id, "body", "text/plain"))
            .unwrap();
        batch
            .put(&FileEntry::new_local(FileId::new(), object.group_id, "image", "image/png"))
            .unwrap();
        store.commit(batch).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts, vec![("file".to_string(), 2), ("object".to_string(), 1)]);
    }

    #[tokio::test]
    async fn put_replaces_group_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");
        let first_group = object.sharing_group.to_string();

        let mut batch = WriteBatch::new();
        batch.put(&object).unwrap();
        store.commit(batch).await.unwrap();

        object.sharing_group = SharingGroupId::new();
        let mut batch = WriteBatch::new();
        batch.put(&object).unwrap();
        store.commit(batch).await.unwrap();

        assert!(store.by_group_raw("object", &first_group).await.unwrap().is_empty());
        assert_eq!(
            store
                .by_group_raw("object", &object.sharing_group.to_string())
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
