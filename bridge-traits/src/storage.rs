//! Key-Value Storage Abstraction
//!
//! Persistent string storage for credentials. Every operation is scoped to a
//! namespace so the PKCE, shared-secret and delegated strategies never read
//! each other's tokens.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{BridgeError, Result};

/// Namespaced key-value store trait
///
/// Abstracts platform-specific preferences storage:
/// - Android: SharedPreferences / DataStore
/// - iOS: UserDefaults
/// - Desktop: SQLite (`bridge-desktop`)
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStore;
///
/// async fn remember(store: &dyn KeyValueStore) -> Result<()> {
///     let mut entries = HashMap::new();
///     entries.insert("sdk_user_access_token".to_string(), "token".to_string());
///     store.save("PKCE", &entries).await
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Upsert every entry of `entries` atomically.
    async fn save(&self, namespace: &str, entries: &HashMap<String, String>) -> Result<()>;

    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Remove every key in the namespace.
    async fn clear_all(&self, namespace: &str) -> Result<()>;
}

/// Process-local store for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), String>>> {
        self.entries
            .lock()
            .map_err(|_| BridgeError::OperationFailed("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn save(&self, namespace: &str, entries: &HashMap<String, String>) -> Result<()> {
        let mut map = self.lock()?;
        for (key, value) in entries {
            map.insert((namespace.to_string(), key.clone()), value.clone());
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn clear_all(&self, namespace: &str) -> Result<()> {
        self.lock()?.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}
