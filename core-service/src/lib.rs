//! Client façade and bootstrap helpers.
//!
//! [`PanClient`] wires host-provided bridges (HTTP transport, key-value
//! store, clock) from a [`ClientConfig`] into the auth and transfer engines.
//! Desktop apps typically enable the `desktop-shims` feature, which lets the
//! config builder fall back to the `bridge-desktop` implementations.
//!
//! ```ignore
//! let config = ClientConfig::builder()
//!     .app_id("my-app-id")
//!     .app_secret("my-app-secret")
//!     .build()?;
//! let client = PanClient::init(config).await?;
//!
//! match client.authorize().await? {
//!     AuthorizeOutcome::AlreadyAuthorized => {}
//!     AuthorizeOutcome::Redirect(url) => open_browser(url),
//! }
//! ```

pub mod error;

pub use error::{CoreError, Result};

pub use core_auth::{
    AuthorizeOutcome, QrCodeAuthTask, QrCodeStatus, TokenRequest, TokenResponse, TokenServer,
};
pub use core_runtime::events::{AuthEvent, CoreEvent, TransferEvent, TransferKind};
pub use core_runtime::{logging, ClientConfig};
pub use core_transfer::{ApiScope, CheckNameMode, RawScope, Task, TaskState, TransferError};

use bridge_traits::http::HttpClient;
use core_auth::AuthManager;
use core_runtime::{CallbackContext, EventBus};
use core_transfer::{Downloader, TransferContext, Uploader};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;
use tracing::{info, instrument};

/// Primary façade exposed to host applications.
///
/// Must be created inside a Tokio runtime. Clones share every engine.
#[derive(Clone)]
pub struct PanClient {
    events: EventBus,
    auth: Arc<AuthManager>,
    downloader: Arc<Downloader>,
    uploader: Arc<Uploader>,
    transfers: TransferContext,
}

impl PanClient {
    /// Build a client that authenticates with PKCE or the shared secret in
    /// `config`.
    pub async fn init(config: ClientConfig) -> Result<Self> {
        Self::init_with_token_server(config, None).await
    }

    /// Build a client whose token exchange is delegated to `token_server`
    /// when one is given.
    #[instrument(skip_all, fields(app_id = %config.app_id))]
    pub async fn init_with_token_server(
        config: ClientConfig,
        token_server: Option<Arc<dyn TokenServer>>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let callbacks = CallbackContext::new()?;

        let auth = Arc::new(
            AuthManager::new(&config, token_server, events.clone(), callbacks.clone()).await?,
        );
        let authorized: Arc<dyn HttpClient> =
            Arc::new(auth.authorized_client(Arc::clone(&config.http_client)));

        let transfers = TransferContext::new(&config, authorized, events.clone(), callbacks)?;
        let downloader = Downloader::new(transfers.clone(), config.download_folder.clone());
        let uploader = Uploader::new(transfers.clone(), Arc::clone(auth.credentials()));

        info!(
            download_folder = %config.download_folder.display(),
            task_concurrency = config.task_concurrency,
            chunk_concurrency = config.chunk_concurrency,
            "Client initialized"
        );

        Ok(Self {
            events,
            auth,
            downloader,
            uploader,
            transfers,
        })
    }

    /// Receive auth and transfer lifecycle events from now on.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    /// Call any API endpoint with the current token.
    pub async fn send<T: DeserializeOwned>(&self, scope: &dyn ApiScope) -> Result<T> {
        Ok(self.transfers.api().call(scope).await?)
    }

    pub async fn is_authorized(&self) -> bool {
        self.auth.is_authorized().await
    }

    /// Either confirm the stored token or return the page the user must
    /// visit.
    pub async fn authorize(&self) -> Result<AuthorizeOutcome> {
        Ok(self.auth.authorize().await?)
    }

    /// Finish a browser authorization with the code (or error) the redirect
    /// delivered.
    pub async fn fetch_token(&self, code: Option<&str>, error: Option<&str>) -> Result<()> {
        Ok(self.auth.fetch_token(code, error).await?)
    }

    /// Start a QR-code login. The returned task polls until the code is
    /// scanned and confirmed, expires or is cancelled.
    pub async fn oauth_qr_code(&self) -> Result<QrCodeAuthTask> {
        Ok(self.auth.oauth_qr_code().await?)
    }

    pub async fn clear_oauth(&self) -> Result<()> {
        Ok(self.auth.clear_oauth().await?)
    }

    pub async fn build_download(
        &self,
        drive_id: &str,
        file_id: &str,
        expire_sec: Option<u32>,
    ) -> Result<Task> {
        Ok(self
            .downloader
            .build_download(drive_id, file_id, expire_sec)
            .await?)
    }

    pub async fn build_upload(
        &self,
        drive_id: &str,
        local_path: impl AsRef<Path>,
        parent_id: Option<&str>,
        check_name_mode: Option<CheckNameMode>,
    ) -> Result<Task> {
        Ok(self
            .uploader
            .build_upload(drive_id, local_path, parent_id, check_name_mode)
            .await?)
    }
}

impl std::fmt::Debug for PanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanClient")
            .field("auth", &self.auth)
            .field("downloads_running", &self.downloader.running())
            .field("uploads_running", &self.uploader.running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::{HttpRequest, HttpResponse};
    use bridge_traits::{KeyValueStore, MemoryKeyValueStore};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHttp {
        requests: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClient for RecordingHttp {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: 200,
                headers: HashMap::new(),
                body: Bytes::from_static(
                    br#"{"file_id":"f","name":"a.txt","size":3,"type":"file","default_drive_id":"d1"}"#,
                ),
            })
        }
    }

    async fn store_with_token() -> Arc<dyn KeyValueStore> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let mut entries = HashMap::new();
        entries.insert("sdk_user_access_token".to_string(), "tok".to_string());
        entries.insert("sdk_user_refresh_token".to_string(), "rt".to_string());
        entries.insert("sdk_user_expired".to_string(), i64::MAX.to_string());
        store.save("Secret", &entries).await.unwrap();
        store
    }

    async fn client(http: Arc<RecordingHttp>, store: Arc<dyn KeyValueStore>) -> PanClient {
        let config = ClientConfig::builder()
            .app_id("app")
            .app_secret("secret")
            .user_agent("alipan-test/1.0")
            .http_client(http)
            .key_value_store(store)
            .build()
            .unwrap();
        PanClient::init(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_api_requests_carry_token_and_user_agent() {
        let http = Arc::new(RecordingHttp::default());
        let client = client(Arc::clone(&http), store_with_token().await).await;
        assert!(client.is_authorized().await);

        let task = client.build_download("d1", "f", None).await.unwrap();
        assert_eq!(task.name(), "a.txt");

        let drive: serde_json::Value = client
            .send(&RawScope::post(
                "adrive/v1.0/user/getDriveInfo",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(drive["default_drive_id"], "d1");

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        for request in requests.iter() {
            assert_eq!(request.authorization(), Some("tok"));
            assert_eq!(
                request.headers.get("User-Agent").map(String::as_str),
                Some("alipan-test/1.0")
            );
        }
    }

    #[tokio::test]
    async fn test_clear_oauth_resets_status() {
        let http = Arc::new(RecordingHttp::default());
        let client = client(http, store_with_token().await).await;
        let mut events = client.subscribe();

        client.clear_oauth().await.unwrap();

        assert!(!client.is_authorized().await);
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::StatusReset)
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments_surface_as_transfer_errors() {
        let http = Arc::new(RecordingHttp::default());
        let client = client(
            Arc::clone(&http),
            Arc::new(MemoryKeyValueStore::new()),
        )
        .await;

        let error = client.build_download("", "f", None).await.unwrap_err();
        assert_eq!(error.code(), "RequestInvalid");
        assert!(http.requests.lock().unwrap().is_empty());
    }
}
