//! # Authentication Manager
//!
//! Session-level orchestration of the credential lifecycle.
//!
//! ## Overview
//!
//! The `AuthManager` owns the single [`Credentials`] instance of a client,
//! the [`TokenAuthenticator`] shared by every API request and the event
//! emission that tells the host what happened:
//!
//! | Operation        | Events                                        |
//! |------------------|-----------------------------------------------|
//! | construction     | `LoginSucceeded` or `StatusReset`             |
//! | `fetch_token`    | `LoginSucceeded`, `LoginFailed`, `LoginCancelled` |
//! | `clear_oauth`    | `StatusReset`                                 |
//! | `auth_invalid`   | `LoggedOut`                                   |
//! | refresh          | `TokenRefreshed` or `LoggedOut`               |
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AuthManager, AuthorizeOutcome};
//! use core_runtime::{CallbackContext, ClientConfig, EventBus};
//!
//! # async fn example(config: ClientConfig) -> core_auth::Result<()> {
//! let manager = AuthManager::new(&config, None, EventBus::new(64), CallbackContext::new()?).await?;
//!
//! if let AuthorizeOutcome::Redirect(url) = manager.authorize().await? {
//!     println!("Open {url} and paste the code");
//!     manager.fetch_token(Some("code-from-browser"), None).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::authenticator::{AuthorizedHttpClient, TokenAuthenticator};
use crate::credentials::{split_scopes, CredentialStrategy, Credentials, TokenServer};
use crate::error::{AuthError, Result};
use crate::oauth::{OAuthEndpoint, PkceVerifier, QR_CODE_PATH};
use crate::qrcode::{QrCodeAuthTask, QrCodeSession};
use crate::types::AuthorizeOutcome;
use bridge_traits::http::HttpClient;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use core_runtime::{ApiBase, CallbackContext, ClientConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub struct AuthManager {
    credentials: Arc<Credentials>,
    endpoint: OAuthEndpoint,
    authenticator: Arc<TokenAuthenticator>,
    event_bus: EventBus,
    callbacks: CallbackContext,
    scope: String,
    user_agent: String,
    qr_poll_interval: Duration,
}

impl AuthManager {
    /// Pick the credential strategy, restore the stored token and announce
    /// the initial status.
    ///
    /// A `token_server` selects the delegated strategy. Otherwise an empty
    /// or absent secret selects PKCE.
    pub async fn new(
        config: &ClientConfig,
        token_server: Option<Arc<dyn TokenServer>>,
        event_bus: EventBus,
        callbacks: CallbackContext,
    ) -> Result<Self> {
        let strategy = match (token_server, config.app_secret.as_deref()) {
            (Some(server), _) => CredentialStrategy::Delegated(server),
            (None, Some(secret)) if !secret.is_empty() => CredentialStrategy::SharedSecret {
                secret: secret.to_string(),
            },
            (None, _) => CredentialStrategy::Pkce(PkceVerifier::new()),
        };

        let credentials = Arc::new(
            Credentials::load(
                config.app_id.clone(),
                config.bundle_id.clone(),
                strategy,
                Arc::clone(&config.key_value_store),
                &config.identifier,
                Arc::clone(&config.clock),
            )
            .await?,
        );

        let endpoint = OAuthEndpoint::new(
            Arc::clone(&config.http_client),
            ApiBase::parse(&config.base_api)?,
            config.user_agent.clone(),
        );
        let authenticator = Arc::new(TokenAuthenticator::new(
            Arc::clone(&credentials),
            endpoint.clone(),
            event_bus.clone(),
        ));

        let manager = Self {
            credentials,
            endpoint,
            authenticator,
            event_bus,
            callbacks,
            scope: config.scope.clone(),
            user_agent: config.user_agent.clone(),
            qr_poll_interval: config.qr_poll_interval,
        };

        if manager.credentials.is_token_valid().await {
            info!("Stored token is valid");
            manager.emit(AuthEvent::LoginSucceeded);
        } else {
            manager.emit(AuthEvent::StatusReset);
        }

        Ok(manager)
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn authenticator(&self) -> Arc<TokenAuthenticator> {
        Arc::clone(&self.authenticator)
    }

    /// Wrap the transport so API requests carry `User-Agent` and the bearer
    /// token, and recover from 401s.
    pub fn authorized_client(&self, transport: Arc<dyn HttpClient>) -> AuthorizedHttpClient {
        AuthorizedHttpClient::new(
            transport,
            Arc::clone(&self.credentials),
            self.authenticator.clone(),
            self.user_agent.clone(),
        )
    }

    pub async fn is_authorized(&self) -> bool {
        self.credentials.is_token_valid().await
    }

    /// Decide whether the user needs to visit the authorization page.
    #[instrument(skip(self))]
    pub async fn authorize(&self) -> Result<AuthorizeOutcome> {
        if self.credentials.is_token_valid().await {
            info!("Already authorized");
            self.emit(AuthEvent::LoginSucceeded);
            return Ok(AuthorizeOutcome::AlreadyAuthorized);
        }

        let url = self
            .credentials
            .authorization_url(self.endpoint.api(), &self.scope)?;
        info!("Authorization page required");
        Ok(AuthorizeOutcome::Redirect(url))
    }

    /// Finish an authorization round trip with the code (or error) the
    /// authorization page returned.
    #[instrument(skip(self, code, error))]
    pub async fn fetch_token(&self, code: Option<&str>, error: Option<&str>) -> Result<()> {
        if let Some(error) = error.filter(|e| !e.is_empty()) {
            warn!(reason = %error, "Authorization cancelled");
            self.emit(AuthEvent::LoginCancelled {
                message: error.to_string(),
            });
            return Err(AuthError::Cancelled(error.to_string()));
        }

        let Some(code) = code.filter(|c| !c.is_empty()) else {
            warn!("Authorization returned no code");
            self.emit(AuthEvent::LoginFailed {
                message: AuthError::MissingAuthCode.to_string(),
            });
            return Err(AuthError::MissingAuthCode);
        };

        let recorded = match self.credentials.exchange_code(&self.endpoint, code).await {
            Ok(token) => self.credentials.record_token(&token).await,
            Err(e) => Err(e),
        };

        match recorded {
            Ok(model) => {
                info!(expires_at = model.expires_at, "Login succeeded");
                self.emit(AuthEvent::LoginSucceeded);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Token exchange failed");
                self.emit(AuthEvent::LoginFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Submit a QR session and start polling its status.
    #[instrument(skip(self))]
    pub async fn oauth_qr_code(self: &Arc<Self>) -> Result<QrCodeAuthTask> {
        let scopes = split_scopes(&self.scope);
        let body = self.credentials.qr_code_request(&scopes).ok_or_else(|| {
            AuthError::QrCode("credential strategy cannot start a QR session".to_string())
        })?;

        let session: QrCodeSession = self.endpoint.post_json(QR_CODE_PATH, &body).await?;
        if session.sid.is_empty() || session.qr_code_url.is_empty() {
            return Err(AuthError::QrCode("QR session response is incomplete".to_string()));
        }
        info!(sid = %session.sid, "QR session created");

        Ok(QrCodeAuthTask::spawn(
            session,
            self.endpoint.clone(),
            Arc::clone(self),
            self.callbacks.clone(),
            self.qr_poll_interval,
        ))
    }

    /// Forget the token (user initiated).
    pub async fn clear_oauth(&self) -> Result<()> {
        self.credentials.clear().await?;
        info!("Credentials cleared");
        self.emit(AuthEvent::StatusReset);
        Ok(())
    }

    /// Forget the token because the platform no longer accepts it.
    pub async fn auth_invalid(&self) {
        self.authenticator.invalidate().await;
    }

    pub(crate) async fn report_login_failure(&self, message: String) {
        self.emit(AuthEvent::LoginFailed { message });
    }

    fn emit(&self, event: AuthEvent) {
        if self.event_bus.emit(CoreEvent::Auth(event)).is_err() {
            debug!("No event subscribers");
        }
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("credentials", &self.credentials)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
