//! # Credential Strategies
//!
//! One [`Credentials`] instance is chosen when the client is built and owns
//! the signed-in user's [`AuthModel`]. The strategy decides how the
//! authorization, token, refresh and QR-code requests look:
//!
//! | Strategy        | Namespace | Refresh                       |
//! |-----------------|-----------|-------------------------------|
//! | `Pkce`          | `PKCE`    | never                         |
//! | `SharedSecret`  | `Secret`  | when a refresh token is stored |
//! | `Delegated`     | `Server`  | when the token server can build one |
//!
//! Delegated credentials forward request construction to an injected
//! [`TokenServer`]; the host's backend keeps the secret.

use crate::error::{AuthError, Result};
use crate::oauth::{OAuthEndpoint, PkceVerifier, AUTHORIZE_PATH};
use crate::token_store::TokenStore;
use crate::types::{AuthModel, TokenRequest, TokenResponse};
use async_trait::async_trait;
use bridge_traits::{Clock, KeyValueStore};
use core_runtime::ApiBase;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use url::Url;

pub const PKCE_NAMESPACE: &str = "PKCE";
pub const SECRET_NAMESPACE: &str = "Secret";
pub const SERVER_NAMESPACE: &str = "Server";

/// Host-provided token issuance for the delegated strategy.
///
/// Every method is optional. When [`token_request`](Self::token_request)
/// returns `None` the code is handed to [`fetch_token`](Self::fetch_token)
/// and the server performs the exchange itself.
#[async_trait]
pub trait TokenServer: Send + Sync {
    /// Body to POST to `oauth/access_token` for an authorization code.
    fn token_request(&self, auth_code: &str) -> Option<TokenRequest> {
        let _ = auth_code;
        None
    }

    /// Body to POST to `oauth/access_token` to refresh.
    fn refresh_request(&self, refresh_token: &str) -> Option<TokenRequest> {
        let _ = refresh_token;
        None
    }

    /// Body to POST to `oauth/authorize/qrcode`.
    fn qr_code_request(&self, scopes: &[String]) -> Option<TokenRequest> {
        let _ = scopes;
        None
    }

    /// Exchange the code out of band. `Ok(None)` means the server cannot.
    async fn fetch_token(&self, auth_code: &str) -> Result<Option<TokenResponse>> {
        let _ = auth_code;
        Ok(None)
    }
}

pub enum CredentialStrategy {
    Pkce(PkceVerifier),
    SharedSecret { secret: String },
    Delegated(Arc<dyn TokenServer>),
}

impl CredentialStrategy {
    pub fn namespace(&self) -> &'static str {
        match self {
            CredentialStrategy::Pkce(_) => PKCE_NAMESPACE,
            CredentialStrategy::SharedSecret { .. } => SECRET_NAMESPACE,
            CredentialStrategy::Delegated(_) => SERVER_NAMESPACE,
        }
    }
}

impl std::fmt::Debug for CredentialStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Split a configured scope string (`"user:base,file:all:read"`).
pub fn split_scopes(scope: &str) -> Vec<String> {
    scope
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn object<const N: usize>(pairs: [(&str, Value); N]) -> TokenRequest {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub struct Credentials {
    app_id: String,
    bundle_id: Option<String>,
    strategy: CredentialStrategy,
    store: TokenStore,
    clock: Arc<dyn Clock>,
    model: RwLock<Option<AuthModel>>,
}

impl Credentials {
    /// Build credentials and restore any token persisted for `identifier`.
    pub async fn load(
        app_id: impl Into<String>,
        bundle_id: Option<String>,
        strategy: CredentialStrategy,
        key_value_store: Arc<dyn KeyValueStore>,
        identifier: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = TokenStore::new(key_value_store, strategy.namespace(), identifier);
        let model = store.load().await?;
        info!(
            strategy = strategy.namespace(),
            restored = model.is_some(),
            "Credentials loaded"
        );
        Ok(Self {
            app_id: app_id.into(),
            bundle_id,
            strategy,
            store,
            clock,
            model: RwLock::new(model),
        })
    }

    pub fn strategy(&self) -> &CredentialStrategy {
        &self.strategy
    }

    pub async fn is_token_valid(&self) -> bool {
        let now = self.clock.unix_timestamp_millis();
        self.model
            .read()
            .await
            .as_ref()
            .map_or(false, |model| model.is_valid(now))
    }

    pub async fn access_token(&self) -> Option<String> {
        self.model
            .read()
            .await
            .as_ref()
            .map(|model| model.access_token.clone())
    }

    pub async fn auth_model(&self) -> Option<AuthModel> {
        self.model.read().await.clone()
    }

    /// Query parameters for the browser authorization page.
    pub fn authorization_query(&self, scope: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![("client_id", self.app_id.clone())];
        if let Some(bundle_id) = &self.bundle_id {
            query.push(("bundle_id", bundle_id.clone()));
        }
        query.push(("scope", scope.to_string()));
        query.push(("redirect_uri", "oob".to_string()));
        query.push(("response_type", "code".to_string()));

        match &self.strategy {
            CredentialStrategy::Pkce(verifier) => {
                query.push(("code_challenge", verifier.challenge()));
                query.push(("code_challenge_method", verifier.challenge_method().to_string()));
            }
            CredentialStrategy::SharedSecret { .. } | CredentialStrategy::Delegated(_) => {
                query.push(("source", "app".to_string()));
            }
        }
        query
    }

    pub fn authorization_url(&self, api: &ApiBase, scope: &str) -> Result<Url> {
        let query = self.authorization_query(scope);
        Ok(api.url_with_query(
            AUTHORIZE_PATH,
            query.iter().map(|(key, value)| (*key, value.as_str())),
        )?)
    }

    /// Body for `oauth/authorize/qrcode`, `None` if the strategy has none.
    pub fn qr_code_request(&self, scopes: &[String]) -> Option<TokenRequest> {
        match &self.strategy {
            CredentialStrategy::Pkce(verifier) => {
                let mut body = object([
                    ("client_id", Value::from(self.app_id.as_str())),
                    ("scopes", Value::from(scopes.to_vec())),
                    ("source", Value::from("app")),
                    ("code_challenge", Value::from(verifier.challenge())),
                    ("code_challenge_method", Value::from(verifier.challenge_method())),
                ]);
                if let Some(bundle_id) = &self.bundle_id {
                    body.insert("bundle_id".to_string(), Value::from(bundle_id.as_str()));
                }
                Some(body)
            }
            CredentialStrategy::SharedSecret { secret } => Some(object([
                ("client_id", Value::from(self.app_id.as_str())),
                ("client_secret", Value::from(secret.as_str())),
                ("scopes", Value::from(scopes.to_vec())),
            ])),
            CredentialStrategy::Delegated(server) => server.qr_code_request(scopes),
        }
    }

    /// Body exchanging `auth_code` for a token.
    ///
    /// `None` only for a delegated server that exchanges codes itself.
    pub fn token_request(&self, auth_code: &str) -> Option<TokenRequest> {
        match &self.strategy {
            CredentialStrategy::Pkce(verifier) => Some(object([
                ("client_id", Value::from(self.app_id.as_str())),
                ("grant_type", Value::from("authorization_code")),
                ("code", Value::from(auth_code)),
                ("code_verifier", Value::from(verifier.verifier())),
            ])),
            CredentialStrategy::SharedSecret { secret } => Some(object([
                ("client_id", Value::from(self.app_id.as_str())),
                ("client_secret", Value::from(secret.as_str())),
                ("grant_type", Value::from("authorization_code")),
                ("code", Value::from(auth_code)),
            ])),
            CredentialStrategy::Delegated(server) => server.token_request(auth_code),
        }
    }

    /// Refresh body, `None` when this credential cannot refresh.
    pub async fn refresh_request(&self) -> Option<TokenRequest> {
        let guard = self.model.read().await;
        let model = guard.as_ref().filter(|model| model.supports_refresh())?;

        match &self.strategy {
            CredentialStrategy::Pkce(_) => None,
            CredentialStrategy::SharedSecret { secret } => Some(object([
                ("client_id", Value::from(self.app_id.as_str())),
                ("client_secret", Value::from(secret.as_str())),
                ("grant_type", Value::from("refresh_token")),
                ("refresh_token", Value::from(model.refresh_token.as_str())),
            ])),
            CredentialStrategy::Delegated(server) => server.refresh_request(&model.refresh_token),
        }
    }

    /// Exchange an authorization code through whichever path the strategy has.
    #[instrument(skip(self, endpoint, auth_code), fields(strategy = self.strategy.namespace()))]
    pub async fn exchange_code(&self, endpoint: &OAuthEndpoint, auth_code: &str) -> Result<TokenResponse> {
        if let Some(body) = self.token_request(auth_code) {
            return endpoint.request_token(&body).await;
        }

        match &self.strategy {
            CredentialStrategy::Delegated(server) => {
                debug!("Delegating code exchange to token server");
                server.fetch_token(auth_code).await?.ok_or_else(|| {
                    AuthError::TokenServer("token server returned no token".to_string())
                })
            }
            _ => Err(AuthError::TokenServer(
                "credential cannot build a token request".to_string(),
            )),
        }
    }

    /// Adopt a token response: expiry is anchored at the current clock.
    pub async fn record_token(&self, response: &TokenResponse) -> Result<AuthModel> {
        let model = AuthModel::from_response(response, self.clock.unix_timestamp_millis());
        self.store.save(&model).await?;
        *self.model.write().await = Some(model.clone());
        Ok(model)
    }

    pub async fn clear(&self) -> Result<()> {
        *self.model.write().await = None;
        self.store.clear().await
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
