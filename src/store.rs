// src/store.rs

use crate::models::{FileFingerprint, UploadSessionRecord};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable fingerprint -> session-record mapping backed by SQLite.
/// Writes are last-writer-wins per key; at most one active transfer
/// exists per fingerprint at a time, so no further locking is needed.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Opens (and if necessary creates) the store at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup().await?;
        Ok(store)
    }

    /// In-memory store, for tests and throwaway runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup().await?;
        Ok(store)
    }

    async fn setup(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS upload_sessions (
                        key     TEXT PRIMARY KEY,
                        record  TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        fingerprint: &FileFingerprint,
    ) -> Result<Option<UploadSessionRecord>, StoreError> {
        let key = fingerprint.storage_key();
        let json: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT record FROM upload_sessions WHERE key = ?1")?;
                let mut rows = stmt.query(params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, record: &UploadSessionRecord) -> Result<(), StoreError> {
        let key = record.fingerprint.storage_key();
        let json = serde_json::to_string(record)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO upload_sessions (key, record) VALUES (?1, ?2)",
                    params![key, json],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, fingerprint: &FileFingerprint) -> Result<(), StoreError> {
        let key = fingerprint.storage_key();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM upload_sessions WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, size: u64, session: &str) -> UploadSessionRecord {
        UploadSessionRecord::new(
            FileFingerprint::new(name, size),
            session.to_string(),
            256 * 1024,
            4,
        )
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let rec = record("cat.jpg", 900_000, "sess-a");

        assert!(store.get(&rec.fingerprint).await.unwrap().is_none());

        store.put(&rec).await.unwrap();
        let loaded = store.get(&rec.fingerprint).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "sess-a");
        assert_eq!(loaded.chunk_size, 256 * 1024);

        store.delete(&rec.fingerprint).await.unwrap();
        assert!(store.get(&rec.fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let store = SessionStore::open_in_memory().await.unwrap();
        store.put(&record("a.png", 10, "first")).await.unwrap();
        store.put(&record("a.png", 10, "second")).await.unwrap();

        let loaded = store
            .get(&FileFingerprint::new("a.png", 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.session_id, "second");
    }

    #[tokio::test]
    async fn distinct_fingerprints_do_not_collide() {
        let store = SessionStore::open_in_memory().await.unwrap();
        store.put(&record("a.png", 10, "one")).await.unwrap();
        store.put(&record("a.png", 11, "two")).await.unwrap();

        let one = store.get(&FileFingerprint::new("a.png", 10)).await.unwrap();
        let two = store.get(&FileFingerprint::new("a.png", 11)).await.unwrap();
        assert_eq!(one.unwrap().session_id, "one");
        assert_eq!(two.unwrap().session_id, "two");
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SessionStore::open(&path).await.unwrap();
            store.put(&record("movie.mp4", 1 << 20, "persisted")).await.unwrap();
        }
        let store = SessionStore::open(&path).await.unwrap();
        let loaded = store
            .get(&FileFingerprint::new("movie.mp4", 1 << 20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.session_id, "persisted");
    }
}
