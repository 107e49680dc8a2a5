//! Concurrent 401s on the same stale token must share one refresh.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::{KeyValueStore, MemoryKeyValueStore};
use bytes::Bytes;
use core_auth::{AuthManager, AuthorizedHttpClient};
use core_runtime::events::{AuthEvent, CoreEvent};
use core_runtime::{CallbackContext, ClientConfig, EventBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fake platform: API answers 401 unless the bearer is the refreshed token.
#[derive(Default)]
struct FakePlatform {
    refreshes: AtomicUsize,
    api_calls: AtomicUsize,
}

fn respond(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body: Bytes::from(body.to_string()),
    }
}

#[async_trait]
impl HttpClient for FakePlatform {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        if request.url.ends_with("/oauth/access_token") {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            // Keep the refresh in flight long enough for the second 401 to queue.
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Ok(respond(
                200,
                r#"{"access_token":"fresh","refresh_token":"rt2","expires_in":7200}"#,
            ));
        }

        self.api_calls.fetch_add(1, Ordering::SeqCst);
        if request.authorization() == Some("fresh") {
            Ok(respond(200, r#"{"default_drive_id":"d1"}"#))
        } else {
            Ok(respond(401, r#"{"code":"AccessTokenInvalid","message":"expired"}"#))
        }
    }
}

async fn seeded_store() -> Arc<dyn KeyValueStore> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let mut entries = HashMap::new();
    entries.insert("sdk_user_access_token".to_string(), "stale".to_string());
    entries.insert("sdk_user_refresh_token".to_string(), "rt".to_string());
    entries.insert("sdk_user_expired".to_string(), i64::MAX.to_string());
    store.save("Secret", &entries).await.unwrap();
    store
}

async fn get_drive_info(client: Arc<AuthorizedHttpClient>) -> HttpResponse {
    client
        .execute(HttpRequest::new(
            HttpMethod::Post,
            "https://openapi.alipan.com/adrive/v1.0/user/getDriveInfo",
        ))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_requests_with_stale_token_refresh_once() {
    let platform = Arc::new(FakePlatform::default());
    let config = ClientConfig::builder()
        .app_id("app")
        .app_secret("secret")
        .http_client(platform.clone())
        .key_value_store(seeded_store().await)
        .build()
        .unwrap();

    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let manager = AuthManager::new(&config, None, bus, CallbackContext::new().unwrap())
        .await
        .unwrap();
    let client = Arc::new(manager.authorized_client(platform.clone()));

    let (first, second) = tokio::join!(
        tokio::spawn(get_drive_info(client.clone())),
        tokio::spawn(get_drive_info(client.clone()))
    );

    assert_eq!(first.unwrap().status, 200);
    assert_eq!(second.unwrap().status, 200);
    assert_eq!(platform.refreshes.load(Ordering::SeqCst), 1);
    assert!(platform.api_calls.load(Ordering::SeqCst) >= 3);

    // Startup status, then exactly one refresh.
    assert_eq!(
        events.recv().await.unwrap(),
        CoreEvent::Auth(AuthEvent::LoginSucceeded)
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        CoreEvent::Auth(AuthEvent::TokenRefreshed { .. })
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn rejected_refresh_logs_out() {
    struct RevokedRefresh;

    #[async_trait]
    impl HttpClient for RevokedRefresh {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            if request.url.ends_with("/oauth/access_token") {
                Ok(respond(400, r#"{"code":"InvalidRefreshToken","message":"revoked"}"#))
            } else {
                Ok(respond(401, ""))
            }
        }
    }

    let transport = Arc::new(RevokedRefresh);
    let config = ClientConfig::builder()
        .app_id("app")
        .app_secret("secret")
        .http_client(transport.clone())
        .key_value_store(seeded_store().await)
        .build()
        .unwrap();
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let manager = AuthManager::new(&config, None, bus, CallbackContext::new().unwrap())
        .await
        .unwrap();
    let client = manager.authorized_client(transport);

    let response = client
        .execute(HttpRequest::new(HttpMethod::Get, "https://openapi.alipan.com/x"))
        .await
        .unwrap();

    assert_eq!(response.status, 401);
    assert!(!manager.is_authorized().await);
    events.recv().await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        CoreEvent::Auth(AuthEvent::LoggedOut)
    );
}
