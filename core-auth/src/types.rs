use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON object POSTed to the token endpoint.
///
/// Built by a credential strategy or supplied by a delegated token server.
pub type TokenRequest = serde_json::Map<String, serde_json::Value>;

/// Token endpoint answer.
///
/// ```
/// use core_auth::TokenResponse;
///
/// let response: TokenResponse = serde_json::from_str(
///     r#"{"access_token":"at","expires_in":7200,"token_type":"Bearer"}"#,
/// ).unwrap();
/// assert_eq!(response.expires_in, 7200);
/// assert!(response.refresh_token.is_none());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Access token, refresh token and absolute expiry of one signed-in user.
///
/// Owned by exactly one credential; persisted per strategy namespace and
/// cleared wholesale on logout.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthModel {
    pub access_token: String,
    /// Empty when the strategy cannot refresh
    pub refresh_token: String,
    /// Unix epoch milliseconds
    pub expires_at: i64,
}

impl AuthModel {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Anchor a token response at `now_millis`.
    pub fn from_response(response: &TokenResponse, now_millis: i64) -> Self {
        Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone().unwrap_or_default(),
            expires_at: now_millis.saturating_add(response.expires_in.saturating_mul(1000)),
        }
    }

    pub fn is_valid(&self, now_millis: i64) -> bool {
        !self.access_token.is_empty() && now_millis < self.expires_at
    }

    pub fn supports_refresh(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

impl fmt::Debug for AuthModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthModel")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &if self.refresh_token.is_empty() { "" } else { "[REDACTED]" })
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outcome of [`crate::AuthManager::authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    /// A valid token is already stored; nothing to do.
    AlreadyAuthorized,
    /// Open this URL in a browser and pass the returned code to `fetch_token`.
    Redirect(url::Url),
}
