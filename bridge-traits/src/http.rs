//! Host HTTP transport.
//!
//! Provides async HTTP operations, byte-range requests and the authenticator
//! hook consulted when a response signals an authorization failure.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BridgeError, Result};

pub const AUTHORIZATION: &str = "Authorization";
pub const USER_AGENT: &str = "User-Agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

/// Outgoing request. Built with chained setters.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.header(AUTHORIZATION, format!("Bearer {}", token.into()))
    }

    /// Request the half-open byte range `[start, end)`.
    pub fn range(self, start: u64, end: u64) -> Self {
        self.header("Range", format!("bytes={}-{}", start, end.saturating_sub(1)))
    }

    /// The bearer token carried by this request, if any.
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
    }

    pub fn json<T: Serialize>(self, payload: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(payload)
            .map_err(|e| BridgeError::OperationFailed(format!("Cannot encode JSON body: {}", e)))?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(Bytes::from(encoded)))
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| BridgeError::OperationFailed(format!("Cannot decode JSON body: {}", e)))
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid UTF-8: {}", e)))
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }
}

/// Transport supplied by the host.
///
/// Implementations may retry transient failures (5xx, 429) themselves but
/// must hand every other status back unchanged: the engines read provider
/// error bodies and signed-URL rejections from the response.
///
/// Authorization is layered on top by wrapping a client together with an
/// [`Authenticator`].
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest, HttpMethod};
///
/// async fn fetch_range(client: &dyn HttpClient, url: &str) -> Result<Bytes> {
///     let request = HttpRequest::new(HttpMethod::Get, url).range(0, 1024);
///     let response = client.execute(request).await?;
///     Ok(response.body)
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Non-2xx statuses are returned as responses, not errors. Errors are
    /// reserved for transport failures (connect, TLS, timeout).
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Hook invoked exactly when a response signals an authorization failure.
///
/// Returns the request to retry (typically with a fresh `Authorization`
/// header) or `None` to give up and surface the failed response.
/// `prior_attempts` counts the authenticator-driven retries already made for
/// the original request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
        prior_attempts: u32,
    ) -> Option<HttpRequest>;
}
