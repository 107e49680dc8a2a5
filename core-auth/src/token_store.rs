//! Token Persistence
//!
//! Stores an [`AuthModel`] in the host's [`KeyValueStore`] under the
//! credential strategy's namespace (`PKCE`, `Secret` or `Server`). Keys are
//! prefixed with the user identifier so several accounts can share one
//! store:
//!
//! - `<identifier>_access_token`
//! - `<identifier>_refresh_token`
//! - `<identifier>_expired` (epoch milliseconds)
//!
//! Token values are never logged.

use crate::error::{AuthError, Result};
use crate::types::AuthModel;
use bridge_traits::KeyValueStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ACCESS_TOKEN: &str = "access_token";
const REFRESH_TOKEN: &str = "refresh_token";
const EXPIRED: &str = "expired";

#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    namespace: &'static str,
    identifier: String,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: &'static str, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        debug!(namespace, identifier = %identifier, "Initializing TokenStore");
        Self {
            store,
            namespace,
            identifier,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    fn key(&self, name: &str) -> String {
        format!("{}_{}", self.identifier, name)
    }

    /// Read the stored model.
    ///
    /// A missing key or an unparsable expiry reads as "no token".
    pub async fn load(&self) -> Result<Option<AuthModel>> {
        let access_token = self.get(ACCESS_TOKEN).await?;
        let refresh_token = self.get(REFRESH_TOKEN).await?;
        let expired = self.get(EXPIRED).await?;

        let (Some(access_token), Some(refresh_token), Some(expired)) =
            (access_token, refresh_token, expired)
        else {
            debug!(namespace = self.namespace, "No stored token");
            return Ok(None);
        };

        match expired.parse::<i64>() {
            Ok(expires_at) => {
                debug!(namespace = self.namespace, expires_at, "Restored stored token");
                Ok(Some(AuthModel::new(access_token, refresh_token, expires_at)))
            }
            Err(e) => {
                warn!(
                    namespace = self.namespace,
                    error = %e,
                    "Stored token expiry is corrupted, ignoring stored token"
                );
                Ok(None)
            }
        }
    }

    pub async fn save(&self, model: &AuthModel) -> Result<()> {
        let mut entries = HashMap::with_capacity(3);
        entries.insert(self.key(ACCESS_TOKEN), model.access_token.clone());
        entries.insert(self.key(REFRESH_TOKEN), model.refresh_token.clone());
        entries.insert(self.key(EXPIRED), model.expires_at.to_string());

        self.store
            .save(self.namespace, &entries)
            .await
            .map_err(|e| {
                warn!(namespace = self.namespace, error = %e, "Failed to persist token");
                AuthError::Storage(e.to_string())
            })?;

        info!(
            namespace = self.namespace,
            expires_at = model.expires_at,
            "Token persisted"
        );
        Ok(())
    }

    /// Remove everything in this strategy's namespace.
    pub async fn clear(&self) -> Result<()> {
        self.store
            .clear_all(self.namespace)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        info!(namespace = self.namespace, "Stored token cleared");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<String>> {
        self.store
            .get(self.namespace, &self.key(name))
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::MemoryKeyValueStore;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = TokenStore::new(kv.clone(), "Secret", "alice");
        let model = AuthModel::new("at", "rt", 42);

        store.save(&model).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(model));
        assert_eq!(
            kv.get("Secret", "alice_expired").await.unwrap(),
            Some("42".to_string())
        );
    }

    #[tokio::test]
    async fn test_identifiers_do_not_collide() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let alice = TokenStore::new(kv.clone(), "PKCE", "alice");
        let bob = TokenStore::new(kv.clone(), "PKCE", "bob");

        alice.save(&AuthModel::new("a", "", 1)).await.unwrap();

        assert!(bob.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_expiry_reads_as_missing() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut entries = HashMap::new();
        entries.insert("u_access_token".to_string(), "at".to_string());
        entries.insert("u_refresh_token".to_string(), "".to_string());
        entries.insert("u_expired".to_string(), "soon".to_string());
        kv.save("Server", &entries).await.unwrap();

        let store = TokenStore::new(kv, "Server", "u");
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_token() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = TokenStore::new(kv, "PKCE", "u");
        store.save(&AuthModel::new("at", "", 1)).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
    }
}
