use std::sync::{Arc, Mutex};

use anyhow::Result;
use diesel::sqlite::SqliteConnection;
use serenity::async_trait;

use super::KeyValueStore;
use crate::{database, database::models::BackupRecord, error::StoreError};

/// Local fallback backend: one row per key in `backup_records`.
pub struct SqliteStore {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(database::establish(path)?)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> diesel::QueryResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Closed)?;
            f(&mut guard).map_err(StoreError::from)
        })
        .await?
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let record = self
            .with_conn(move |conn| BackupRecord::find_by_key(conn, &key))
            .await?;
        Ok(record.map(|r| r.value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| BackupRecord::upsert(conn, &key, &value))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| BackupRecord::delete(conn, &key))
            .await?;
        Ok(())
    }
}
