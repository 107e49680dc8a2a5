//! # Client Configuration
//!
//! Builder-based configuration for the Alipan SDK client.
//!
//! ## Overview
//!
//! [`ClientConfig`] holds the application credentials, the transfer tuning
//! knobs and every bridge the core needs. The builder fails fast: a missing
//! required value or bridge is reported at `build()` with an actionable
//! message, never later in the middle of a transfer.
//!
//! ## Required
//!
//! - `app_id` - the open-platform application id
//! - `HttpClient` and `KeyValueStore` bridges (desktop defaults available)
//!
//! ## Credential selection
//!
//! An empty or absent `app_secret` selects the PKCE flow; a non-empty secret
//! selects the shared-secret flow. A delegated token server is injected at
//! client construction, not here.
//!
//! When the `desktop-shims` feature is enabled, `ReqwestHttpClient` and a
//! `SqliteKeyValueStore` are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::ClientConfig;
//!
//! let config = ClientConfig::builder()
//!     .app_id("my-app-id")
//!     .download_folder("/home/ann/Downloads")
//!     .build()?;
//! ```
//!
//! ```should_panic
//! use core_runtime::config::ClientConfig;
//!
//! // Missing app id
//! let config = ClientConfig::builder()
//!     .build()
//!     .expect("Should fail - app id is required");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, KeyValueStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_API: &str = "https://openapi.alipan.com/";
pub const DEFAULT_SCOPE: &str = "user:base,file:all:read";
pub const DEFAULT_IDENTIFIER: &str = "sdk_user";
pub const DEFAULT_TASK_CONCURRENCY: usize = 2;
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 3;
pub const DEFAULT_URL_EXPIRY_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_QR_POLL_INTERVAL: Duration = Duration::from_millis(1500);

fn default_user_agent() -> String {
    format!("alipan-sdk/{}", env!("CARGO_PKG_VERSION"))
}

/// Configuration for one SDK client instance.
#[derive(Clone)]
pub struct ClientConfig {
    /// Open-platform application id (`client_id`)
    pub app_id: String,

    /// Shared secret; `None` selects PKCE
    pub app_secret: Option<String>,

    /// Space or comma separated OAuth scopes
    pub scope: String,

    /// Namespaces persisted credentials for multi-account hosts
    pub identifier: String,

    /// Mobile bundle id sent with authorization requests
    pub bundle_id: Option<String>,

    /// Base URL every API path is resolved against
    pub base_api: String,

    /// Destination folder for downloads
    pub download_folder: PathBuf,

    pub user_agent: String,

    /// Whole transfers running their orchestration loop at once, per direction
    pub task_concurrency: usize,

    /// Parallel chunk requests per transfer
    pub chunk_concurrency: usize,

    /// Consecutive signed-URL expiries without progress before a task fails
    pub url_expiry_retry_limit: u32,

    pub qr_poll_interval: Duration,

    pub http_client: Arc<dyn HttpClient>,

    pub key_value_store: Arc<dyn KeyValueStore>,

    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("identifier", &self.identifier)
            .field("bundle_id", &self.bundle_id)
            .field("base_api", &self.base_api)
            .field("download_folder", &self.download_folder)
            .field("user_agent", &self.user_agent)
            .field("task_concurrency", &self.task_concurrency)
            .field("chunk_concurrency", &self.chunk_concurrency)
            .field("url_expiry_retry_limit", &self.url_expiry_retry_limit)
            .field("http_client", &"HttpClient { ... }")
            .field("key_value_store", &"KeyValueStore { ... }")
            .finish()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// True when the PKCE flow applies (no usable shared secret).
    pub fn uses_pkce(&self) -> bool {
        self.app_secret.as_deref().map_or(true, str::is_empty)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(Error::Config("App id cannot be empty".to_string()));
        }

        if self.identifier.trim().is_empty() {
            return Err(Error::Config("Identifier cannot be empty".to_string()));
        }

        if self.task_concurrency == 0 || self.chunk_concurrency == 0 {
            return Err(Error::Config(
                "Task and chunk concurrency must be greater than 0".to_string(),
            ));
        }

        if self.url_expiry_retry_limit == 0 {
            return Err(Error::Config(
                "URL expiry retry limit must be greater than 0".to_string(),
            ));
        }

        url::Url::parse(&self.base_api)
            .map_err(|e| Error::Config(format!("Invalid base API URL: {}", e)))?;

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for API and transfer requests. \
                 Desktop: enable the 'desktop-shims' feature to use ReqwestHttpClient. \
                 Mobile: inject the platform HTTP stack."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn key_value_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "KeyValueStore".to_string(),
        message: "KeyValueStore implementation is required for credential persistence. \
                 Desktop: enable the 'desktop-shims' feature to use SqliteKeyValueStore. \
                 Mobile: inject SharedPreferences/UserDefaults backed storage."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(Duration::from_secs(120)).map_err(|e| {
        Error::Internal(format!("Failed to initialize default HttpClient: {}", e))
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_key_value_store(path: Option<PathBuf>) -> Result<Arc<dyn KeyValueStore>> {
    use bridge_desktop::SqliteKeyValueStore;
    use std::thread;
    use tokio::runtime::{Builder, Handle};

    let init_store = move || -> Result<SqliteKeyValueStore> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed to create Tokio runtime for default key-value store: {}",
                    e
                ))
            })?;

        runtime
            .block_on(async {
                match path {
                    Some(path) => SqliteKeyValueStore::new(path).await,
                    None => SqliteKeyValueStore::open_default().await,
                }
            })
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default KeyValueStore: {}", e))
            })
    };

    // block_on panics inside a runtime, so hop to a plain thread there.
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(init_store).join().map_err(|_| {
            Error::Internal("Thread panicked while creating default KeyValueStore".to_string())
        })??,
        Err(_) => init_store()?,
    };

    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_key_value_store(_path: Option<PathBuf>) -> Result<Arc<dyn KeyValueStore>> {
    Err(key_value_store_missing_error())
}

/// Builder for constructing [`ClientConfig`] instances.
#[derive(Default)]
pub struct ClientConfigBuilder {
    app_id: Option<String>,
    app_secret: Option<String>,
    scope: Option<String>,
    identifier: Option<String>,
    bundle_id: Option<String>,
    base_api: Option<String>,
    download_folder: Option<PathBuf>,
    user_agent: Option<String>,
    task_concurrency: Option<usize>,
    chunk_concurrency: Option<usize>,
    url_expiry_retry_limit: Option<u32>,
    qr_poll_interval: Option<Duration>,
    credential_db_path: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ClientConfigBuilder {
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    /// Defaults to `user:base,file:all:read`.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Defaults to `sdk_user`.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn base_api(mut self, base_api: impl Into<String>) -> Self {
        self.base_api = Some(base_api.into());
        self
    }

    /// Defaults to `<temp dir>/alipan-downloads`.
    pub fn download_folder<P: Into<PathBuf>>(mut self, folder: P) -> Self {
        self.download_folder = Some(folder.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn task_concurrency(mut self, n: usize) -> Self {
        self.task_concurrency = Some(n);
        self
    }

    pub fn chunk_concurrency(mut self, n: usize) -> Self {
        self.chunk_concurrency = Some(n);
        self
    }

    pub fn url_expiry_retry_limit(mut self, limit: u32) -> Self {
        self.url_expiry_retry_limit = Some(limit);
        self
    }

    pub fn qr_poll_interval(mut self, interval: Duration) -> Self {
        self.qr_poll_interval = Some(interval);
        self
    }

    /// Location of the default SQLite credential store (`desktop-shims` only).
    pub fn credential_db_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.credential_db_path = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the configuration, injecting platform defaults where allowed.
    ///
    /// # Errors
    ///
    /// - `Error::Config` when `app_id` is missing or a value is out of range
    /// - `Error::CapabilityMissing` when a bridge is absent and no default
    ///   exists for this build
    pub fn build(self) -> Result<ClientConfig> {
        let app_id = self.app_id.ok_or_else(|| {
            Error::Config("App id is required. Use .app_id() to set it.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let key_value_store = match self.key_value_store {
            Some(store) => store,
            None => provide_default_key_value_store(self.credential_db_path)?,
        };

        let config = ClientConfig {
            app_id,
            app_secret: self.app_secret,
            scope: self.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            identifier: self
                .identifier
                .unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string()),
            bundle_id: self.bundle_id,
            base_api: self.base_api.unwrap_or_else(|| DEFAULT_BASE_API.to_string()),
            download_folder: self
                .download_folder
                .unwrap_or_else(|| std::env::temp_dir().join("alipan-downloads")),
            user_agent: self.user_agent.unwrap_or_else(default_user_agent),
            task_concurrency: self.task_concurrency.unwrap_or(DEFAULT_TASK_CONCURRENCY),
            chunk_concurrency: self.chunk_concurrency.unwrap_or(DEFAULT_CHUNK_CONCURRENCY),
            url_expiry_retry_limit: self
                .url_expiry_retry_limit
                .unwrap_or(DEFAULT_URL_EXPIRY_RETRY_LIMIT),
            qr_poll_interval: self.qr_poll_interval.unwrap_or(DEFAULT_QR_POLL_INTERVAL),
            http_client,
            key_value_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{HttpRequest, HttpResponse, MemoryKeyValueStore};

    struct NoopHttpClient;

    #[async_trait]
    impl HttpClient for NoopHttpClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Err(bridge_traits::BridgeError::NotAvailable("offline".to_string()))
        }
    }

    fn builder_with_bridges() -> ClientConfigBuilder {
        ClientConfig::builder()
            .http_client(Arc::new(NoopHttpClient))
            .key_value_store(Arc::new(MemoryKeyValueStore::new()))
    }

    #[test]
    fn test_defaults_applied() {
        let config = builder_with_bridges().app_id("app").build().unwrap();

        assert_eq!(config.scope, DEFAULT_SCOPE);
        assert_eq!(config.identifier, DEFAULT_IDENTIFIER);
        assert_eq!(config.base_api, DEFAULT_BASE_API);
        assert_eq!(config.task_concurrency, 2);
        assert_eq!(config.chunk_concurrency, 3);
        assert_eq!(config.qr_poll_interval, Duration::from_millis(1500));
        assert!(config.uses_pkce());
    }

    #[test]
    fn test_secret_selects_shared_secret_flow() {
        let config = builder_with_bridges()
            .app_id("app")
            .app_secret("s3cr3t")
            .build()
            .unwrap();
        assert!(!config.uses_pkce());

        let empty = builder_with_bridges()
            .app_id("app")
            .app_secret("")
            .build()
            .unwrap();
        assert!(empty.uses_pkce());
    }

    #[test]
    fn test_builder_requires_app_id() {
        let result = builder_with_bridges().build();
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("App id")));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = builder_with_bridges()
            .app_id("app")
            .chunk_concurrency(0)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_base_api_rejected() {
        let result = builder_with_bridges()
            .app_id("app")
            .base_api("not a url")
            .build();
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("base API")));
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = builder_with_bridges()
            .app_id("app")
            .app_secret("s3cr3t")
            .build()
            .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cr3t"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_missing_http_client_is_capability_error() {
        let result = ClientConfig::builder()
            .app_id("app")
            .key_value_store(Arc::new(MemoryKeyValueStore::new()))
            .build();
        assert!(matches!(
            result,
            Err(Error::CapabilityMissing { capability, .. }) if capability == "HttpClient"
        ));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_build_with_desktop_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::builder()
            .app_id("app")
            .credential_db_path(dir.path().join("credentials.db"))
            .build()
            .expect("desktop defaults should succeed");

        let store = config.key_value_store.clone();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut entries = std::collections::HashMap::new();
            entries.insert("k".to_string(), "v".to_string());
            store.save("PKCE", &entries).await.unwrap();
            assert_eq!(store.get("PKCE", "k").await.unwrap().as_deref(), Some("v"));
        });
    }
}
