//! Reqwest transport for desktop hosts.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse},
};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = concat!("alipan-sdk/", env!("CARGO_PKG_VERSION"));

/// Attempts per request when the server answers 5xx or 429.
const TRANSIENT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Pooled rustls client.
///
/// Transient statuses (5xx, 429) and connection failures are retried with
/// doubling backoff. Every other status, including the last transient one,
/// is returned as a response so provider error bodies reach the caller.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
    attempts: u32,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(60))
    }

    /// `timeout` bounds a whole request including its body, so it has to
    /// cover one 2 MiB chunk on a slow link.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(8)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| {
                BridgeError::OperationFailed(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            attempts: TRANSIENT_ATTEMPTS,
        }
    }

    /// Disable (`1`) or widen transient retries.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    fn prepare(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            // Bytes clones share the buffer
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    async fn read(response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to read body: {}", e)))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn transport_error(error: reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout(error.to_string())
        } else if error.is_connect() {
            BridgeError::OperationFailed(format!("Connection failed: {}", error))
        } else {
            BridgeError::OperationFailed(error.to_string())
        }
    }

    fn backoff(attempt: u32) -> Duration {
        BACKOFF_BASE
            .saturating_mul(1 << attempt.min(16))
            .min(BACKOFF_CAP)
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let last = attempt + 1 >= self.attempts;
            match self.prepare(&request).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if last || !(status >= 500 || status == 429) {
                        return Self::read(response).await;
                    }
                    warn!(status, attempt = attempt + 1, "Transient HTTP status, retrying");
                }
                Err(error) if last => return Err(Self::transport_error(error)),
                Err(error) => {
                    warn!(error = %error, attempt = attempt + 1, "HTTP request failed, retrying");
                }
            }

            let delay = Self::backoff(attempt);
            debug!(delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
