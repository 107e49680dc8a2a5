//! Credential storage using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::KeyValueStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_entries (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (namespace, key)
    )
"#;

/// SQLite-backed key-value store implementation
///
/// One table keyed by `(namespace, key)`. `save` writes all entries in a
/// single transaction so a token and its expiry are never persisted apart.
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    /// Open (or create) the store at `db_path`
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to connect to DB: {}", e)))?;

        Self::init_schema(&pool).await?;
        debug!(path = ?db_path, "Initialized key-value store");

        Ok(Self { pool })
    }

    /// Default location under the platform data directory
    pub async fn open_default() -> Result<Self> {
        let base = dirs::data_local_dir().ok_or_else(|| {
            BridgeError::NotAvailable("No local data directory on this platform".to_string())
        })?;
        Self::new(base.join("alipan-sdk").join("credentials.db")).await
    }

    /// Create an in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        // A single connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to connect to DB: {}", e)))?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to create table: {}", e)))?;
        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn save(&self, namespace: &str, entries: &HashMap<String, String>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            BridgeError::Storage(format!("Failed to begin transaction: {}", e))
        })?;

        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO kv_entries (namespace, key, value, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(namespace, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(namespace)
            .bind(key)
            .bind(value)
            .bind(Self::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to save entry: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to commit: {}", e)))?;

        debug!(namespace, count = entries.len(), "Saved entries");
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to get entry: {}", e)))?;

        Ok(row.map(|row| row.get(0)))
    }

    async fn clear_all(&self, namespace: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::Storage(format!("Failed to clear entries: {}", e)))?;

        debug!(namespace, "Cleared namespace");
        Ok(())
    }
}
