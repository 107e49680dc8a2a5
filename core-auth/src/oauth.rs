//! OAuth Endpoint Access and PKCE
//!
//! Low-level calls against the open platform's `oauth/*` endpoints:
//!
//! - PKCE verifier generation and S256 challenge derivation
//! - token exchange and refresh (`POST oauth/access_token`)
//! - generic JSON calls used by the QR-code flow
//! - structured provider errors parsed from non-2xx bodies
//!
//! These calls go through the raw [`HttpClient`], never through the
//! authorizing decorator, so a refresh can never trigger another refresh.
//!
//! # Security
//!
//! - Verifier, codes and tokens are never logged
//! - The verifier stays in memory for the lifetime of one credential

use crate::error::{AuthError, Result};
use crate::types::{TokenRequest, TokenResponse};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, USER_AGENT};
use core_runtime::ApiBase;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub const TOKEN_PATH: &str = "oauth/access_token";
pub const AUTHORIZE_PATH: &str = "oauth/authorize";
pub const QR_CODE_PATH: &str = "oauth/authorize/qrcode";

/// Only `S256` is ever sent.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

const VERIFIER_BYTES: usize = 30;

/// PKCE (Proof Key for Code Exchange) verifier.
///
/// Generated once per credential instance. Only the challenge leaves the
/// process during authorization; the verifier goes with the token exchange.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
}

impl PkceVerifier {
    /// Hex encoding of 30 cryptographically random bytes.
    pub fn new() -> Self {
        let mut bytes = [0u8; VERIFIER_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self {
            verifier: hex::encode(bytes),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// `BASE64URL-NOPAD(SHA256(verifier))`
    pub fn challenge(&self) -> String {
        let hash = Sha256::digest(self.verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }

    pub fn challenge_method(&self) -> &'static str {
        CODE_CHALLENGE_METHOD
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Turn a non-2xx response into [`AuthError::Provider`].
///
/// `code` falls back to the HTTP status when the body has none.
pub fn provider_error(response: &HttpResponse) -> AuthError {
    let body: Option<ProviderErrorBody> = response.json().ok();
    let (code, message) = match body {
        Some(body) => (body.code, body.message),
        None => (None, None),
    };
    AuthError::Provider {
        status: response.status,
        code: code.unwrap_or_else(|| response.status.to_string()),
        message: message
            .or_else(|| response.text().ok())
            .unwrap_or_default(),
    }
}

/// Unauthenticated access to the OAuth endpoints.
#[derive(Clone)]
pub struct OAuthEndpoint {
    http_client: Arc<dyn HttpClient>,
    api: ApiBase,
    user_agent: String,
}

impl OAuthEndpoint {
    pub fn new(http_client: Arc<dyn HttpClient>, api: ApiBase, user_agent: impl Into<String>) -> Self {
        Self {
            http_client,
            api,
            user_agent: user_agent.into(),
        }
    }

    pub fn api(&self) -> &ApiBase {
        &self.api
    }

    /// Exchange a token request (authorization code or refresh token).
    #[instrument(skip(self, body))]
    pub async fn request_token(&self, body: &TokenRequest) -> Result<TokenResponse> {
        debug!(
            grant_type = body.get("grant_type").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "Requesting access token"
        );
        let response: TokenResponse = self.post_json(TOKEN_PATH, body).await?;
        debug!(expires_in = response.expires_in, "Access token issued");
        Ok(response)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.api.url(path)?;
        let request = HttpRequest::new(HttpMethod::Post, url.as_str())
            .header(USER_AGENT, self.user_agent.as_str())
            .json(body)?;
        self.send(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.api.url(path)?;
        let request =
            HttpRequest::new(HttpMethod::Get, url.as_str()).header(USER_AGENT, self.user_agent.as_str());
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let response = self.http_client.execute(request).await?;
        if !response.is_success() {
            let error = provider_error(&response);
            warn!(status = response.status, error = %error, "OAuth endpoint rejected request");
            return Err(error);
        }
        Ok(response.json()?)
    }
}
