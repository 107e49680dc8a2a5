//! # Token Authenticator
//!
//! Reacts to `401 Unauthorized` answers on API requests.
//!
//! Refresh is single-flight: every caller that saw a 401 queues on one mutex.
//! The first holder refreshes; later holders notice that their request was
//! sent with an older token and simply retry with the current one. An
//! original request is retried at most [`MAX_AUTH_RETRIES`] times.
//!
//! [`AuthorizedHttpClient`] is the decorator that stamps `User-Agent` and
//! `Authorization` on outgoing requests and drives the authenticator.

use crate::credentials::Credentials;
use crate::error::AuthError;
use crate::oauth::OAuthEndpoint;
use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{Authenticator, HttpClient, HttpRequest, HttpResponse, USER_AGENT};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const MAX_AUTH_RETRIES: u32 = 2;

pub struct TokenAuthenticator {
    credentials: Arc<Credentials>,
    endpoint: OAuthEndpoint,
    event_bus: EventBus,
    refresh_lock: Mutex<()>,
}

impl TokenAuthenticator {
    pub fn new(credentials: Arc<Credentials>, endpoint: OAuthEndpoint, event_bus: EventBus) -> Self {
        Self {
            credentials,
            endpoint,
            event_bus,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Drop the token and tell the host the user is logged out.
    pub async fn invalidate(&self) {
        if let Err(e) = self.credentials.clear().await {
            warn!(error = %e, "Failed to clear credentials after invalidation");
        }
        info!("Authentication invalid, user logged out");
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::LoggedOut));
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    #[instrument(skip(self, request, response), fields(status = response.status))]
    async fn authenticate(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
        prior_attempts: u32,
    ) -> Option<HttpRequest> {
        if prior_attempts >= MAX_AUTH_RETRIES {
            warn!(prior_attempts, "Giving up after repeated authorization failures");
            return None;
        }

        let _guard = self.refresh_lock.lock().await;

        let Some(refresh) = self.credentials.refresh_request().await else {
            self.invalidate().await;
            return None;
        };

        if let Some(current) = self.credentials.access_token().await {
            if request.authorization() != Some(current.as_str()) {
                debug!("Token already refreshed by another request, retrying");
                return Some(request.clone().bearer_token(current));
            }
        }

        match self.endpoint.request_token(&refresh).await {
            Ok(token) => match self.credentials.record_token(&token).await {
                Ok(model) => {
                    info!(expires_at = model.expires_at, "Access token refreshed");
                    let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::TokenRefreshed {
                        expires_at: model.expires_at,
                    }));
                    Some(request.clone().bearer_token(model.access_token))
                }
                Err(e) => {
                    warn!(error = %e, "Failed to persist refreshed token");
                    None
                }
            },
            Err(AuthError::Provider { status, code, .. }) if (400..500).contains(&status) => {
                warn!(status, code = %code, "Refresh token rejected");
                self.invalidate().await;
                None
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                None
            }
        }
    }
}

/// [`HttpClient`] decorator for open-platform API calls.
pub struct AuthorizedHttpClient {
    inner: Arc<dyn HttpClient>,
    credentials: Arc<Credentials>,
    authenticator: Arc<dyn Authenticator>,
    user_agent: String,
}

impl AuthorizedHttpClient {
    pub fn new(
        inner: Arc<dyn HttpClient>,
        credentials: Arc<Credentials>,
        authenticator: Arc<dyn Authenticator>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            credentials,
            authenticator,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl HttpClient for AuthorizedHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        let mut request = request.header(USER_AGENT, self.user_agent.as_str());
        if let Some(token) = self.credentials.access_token().await {
            request = request.bearer_token(token);
        }

        let mut attempts = 0;
        loop {
            let response = self.inner.execute(request.clone()).await?;
            if !response.is_unauthorized() {
                return Ok(response);
            }

            match self
                .authenticator
                .authenticate(&request, &response, attempts)
                .await
            {
                Some(retry) => {
                    request = retry;
                    attempts += 1;
                }
                None => return Ok(response),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStrategy;
    use crate::oauth::PkceVerifier;
    use crate::types::TokenResponse;
    use bridge_traits::http::{HttpMethod, AUTHORIZATION};
    use bridge_traits::{MemoryKeyValueStore, SystemClock};
    use bytes::Bytes;
    use core_runtime::ApiBase;
    use mockall::mock;
    use mockall::predicate::*;
    use std::collections::HashMap;

    mock! {
        Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    async fn signed_in(strategy: CredentialStrategy, refresh: Option<&str>) -> Arc<Credentials> {
        let creds = Credentials::load(
            "app",
            None,
            strategy,
            Arc::new(MemoryKeyValueStore::new()),
            "user",
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        creds
            .record_token(&TokenResponse {
                access_token: "stale".to_string(),
                refresh_token: refresh.map(str::to_string),
                expires_in: 3600,
                token_type: None,
            })
            .await
            .unwrap();
        Arc::new(creds)
    }

    fn endpoint(http: MockHttp) -> OAuthEndpoint {
        OAuthEndpoint::new(
            Arc::new(http),
            ApiBase::parse("https://openapi.alipan.com/").unwrap(),
            "ua",
        )
    }

    fn stale_request() -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, "https://openapi.alipan.com/adrive/v1.0/user/getDriveInfo")
            .bearer_token("stale")
    }

    #[tokio::test]
    async fn test_without_refresh_capability_logs_out() {
        let creds = signed_in(CredentialStrategy::Pkce(PkceVerifier::new()), None).await;
        let mut oauth = MockHttp::new();
        oauth.expect_execute().times(0);
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let authenticator = TokenAuthenticator::new(creds.clone(), endpoint(oauth), bus);

        let retry = authenticator
            .authenticate(&stale_request(), &response(401, ""), 0)
            .await;

        assert!(retry.is_none());
        assert!(creds.access_token().await.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::LoggedOut)
        );
    }

    #[tokio::test]
    async fn test_refresh_then_retry_with_new_token() {
        let creds = signed_in(
            CredentialStrategy::SharedSecret {
                secret: "s".to_string(),
            },
            Some("rt"),
        )
        .await;
        let mut oauth = MockHttp::new();
        oauth.expect_execute().times(1).returning(|_| {
            Ok(response(
                200,
                r#"{"access_token":"fresh","refresh_token":"rt2","expires_in":7200}"#,
            ))
        });
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let authenticator = TokenAuthenticator::new(creds.clone(), endpoint(oauth), bus);

        let retry = authenticator
            .authenticate(&stale_request(), &response(401, ""), 0)
            .await
            .unwrap();

        assert_eq!(retry.authorization(), Some("fresh"));
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshed { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_with_outdated_token_retries_without_refresh() {
        let creds = signed_in(
            CredentialStrategy::SharedSecret {
                secret: "s".to_string(),
            },
            Some("rt"),
        )
        .await;
        let mut oauth = MockHttp::new();
        oauth.expect_execute().times(0);
        let authenticator = TokenAuthenticator::new(creds, endpoint(oauth), EventBus::new(8));

        let older = HttpRequest::new(HttpMethod::Get, "https://x").bearer_token("older");
        let retry = authenticator
            .authenticate(&older, &response(401, ""), 0)
            .await
            .unwrap();

        assert_eq!(retry.authorization(), Some("stale"));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let creds = signed_in(
            CredentialStrategy::SharedSecret {
                secret: "s".to_string(),
            },
            Some("rt"),
        )
        .await;
        let mut oauth = MockHttp::new();
        oauth.expect_execute().times(0);
        let authenticator = TokenAuthenticator::new(creds, endpoint(oauth), EventBus::new(8));

        let retry = authenticator
            .authenticate(&stale_request(), &response(401, ""), MAX_AUTH_RETRIES)
            .await;
        assert!(retry.is_none());
    }

    #[tokio::test]
    async fn test_authorized_client_stamps_headers() {
        let creds = signed_in(CredentialStrategy::Pkce(PkceVerifier::new()), None).await;
        let mut api = MockHttp::new();
        api.expect_execute()
            .withf(|request| {
                request.headers.get(USER_AGENT).map(String::as_str) == Some("alipan-test")
                    && request.headers.get(AUTHORIZATION).map(String::as_str) == Some("Bearer stale")
            })
            .times(1)
            .returning(|_| Ok(response(200, "{}")));
        let mut oauth = MockHttp::new();
        oauth.expect_execute().times(0);
        let authenticator = Arc::new(TokenAuthenticator::new(
            creds.clone(),
            endpoint(oauth),
            EventBus::new(8),
        ));

        let client = AuthorizedHttpClient::new(Arc::new(api), creds, authenticator, "alipan-test");
        let response = client
            .execute(HttpRequest::new(HttpMethod::Get, "https://x"))
            .await
            .unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_authorized_client_surfaces_401_when_authenticator_gives_up() {
        let creds = signed_in(CredentialStrategy::Pkce(PkceVerifier::new()), None).await;
        let mut api = MockHttp::new();
        api.expect_execute()
            .with(always())
            .times(1)
            .returning(|_| Ok(response(401, "")));
        let mut oauth = MockHttp::new();
        oauth.expect_execute().times(0);
        let authenticator = Arc::new(TokenAuthenticator::new(
            creds.clone(),
            endpoint(oauth),
            EventBus::new(8),
        ));

        let client = AuthorizedHttpClient::new(Arc::new(api), creds, authenticator, "ua");
        let response = client
            .execute(HttpRequest::new(HttpMethod::Get, "https://x"))
            .await
            .unwrap();
        assert_eq!(response.status, 401);
    }
}
