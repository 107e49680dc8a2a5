//! REST endpoint descriptors and the client that sends them.
//!
//! Each descriptor is `{method, path, parameters}`. POST parameters go out as
//! a JSON body with `null` fields dropped; GET parameters become the query
//! string. Non-2xx answers become [`TransferError::Provider`] with the
//! platform's `code` and `message`.

use crate::error::{Result, TransferError};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use core_auth::oauth::provider_error;
use core_runtime::ApiBase;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub trait ApiScope: Send + Sync {
    fn method(&self) -> HttpMethod;

    /// Path relative to the API base.
    fn path(&self) -> String;

    fn parameters(&self) -> Result<Value>;
}

macro_rules! file_scope {
    ($scope:ty, $method:expr, $path:literal) => {
        impl ApiScope for $scope {
            fn method(&self) -> HttpMethod {
                $method
            }

            fn path(&self) -> String {
                $path.to_string()
            }

            fn parameters(&self) -> Result<Value> {
                Ok(serde_json::to_value(self)?)
            }
        }
    };
}

/// Any endpoint, for hosts calling APIs the SDK does not wrap.
#[derive(Debug, Clone)]
pub struct RawScope {
    pub method: HttpMethod,
    pub path: String,
    pub parameters: Value,
}

impl RawScope {
    pub fn post(path: impl Into<String>, parameters: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            parameters,
        }
    }

    pub fn get(path: impl Into<String>, parameters: Value) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            parameters,
        }
    }
}

impl ApiScope for RawScope {
    fn method(&self) -> HttpMethod {
        self.method
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn parameters(&self) -> Result<Value> {
        Ok(self.parameters.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GetFile {
    pub drive_id: String,
    pub file_id: String,
}
file_scope!(GetFile, HttpMethod::Post, "adrive/v1.0/openFile/get");

#[derive(Debug, Clone, Serialize)]
pub struct GetDownloadUrl {
    pub drive_id: String,
    pub file_id: String,
    pub expire_sec: u32,
}
file_scope!(GetDownloadUrl, HttpMethod::Post, "adrive/v1.0/openFile/getDownloadUrl");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartNumber {
    pub part_number: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFile {
    pub drive_id: String,
    pub parent_file_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub check_name_mode: String,
    pub size: u64,
    pub part_info_list: Vec<PartNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_version: Option<String>,
}
file_scope!(CreateFile, HttpMethod::Post, "adrive/v1.0/openFile/create");

#[derive(Debug, Clone, Serialize)]
pub struct GetUploadUrl {
    pub drive_id: String,
    pub file_id: String,
    pub upload_id: String,
    pub part_info_list: Vec<PartNumber>,
}
file_scope!(GetUploadUrl, HttpMethod::Post, "adrive/v1.0/openFile/getUploadUrl");

#[derive(Debug, Clone, Serialize)]
pub struct CompleteUpload {
    pub drive_id: String,
    pub file_id: String,
    pub upload_id: String,
}
file_scope!(CompleteUpload, HttpMethod::Post, "adrive/v1.0/openFile/complete");

/// `GetFile` answer.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub parent_file_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub content_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadUrl {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub expiration: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    #[serde(default)]
    pub upload_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedFile {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub exist: bool,
    #[serde(default)]
    pub rapid_upload: bool,
    #[serde(default)]
    pub part_info_list: Vec<PartInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadUrls {
    #[serde(default)]
    pub part_info_list: Vec<PartInfo>,
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sends descriptors through the authorizing HTTP client.
#[derive(Clone)]
pub struct ApiClient {
    http_client: Arc<dyn HttpClient>,
    api: ApiBase,
}

impl ApiClient {
    pub fn new(http_client: Arc<dyn HttpClient>, api: ApiBase) -> Self {
        Self { http_client, api }
    }

    fn build_request(&self, scope: &dyn ApiScope) -> Result<HttpRequest> {
        let path = scope.path();
        let parameters = strip_nulls(scope.parameters()?);

        match scope.method() {
            HttpMethod::Get | HttpMethod::Delete | HttpMethod::Head => {
                let pairs: Vec<(String, String)> = match &parameters {
                    Value::Object(map) => map
                        .iter()
                        .map(|(k, v)| (k.clone(), query_value(v)))
                        .collect(),
                    _ => Vec::new(),
                };
                let url = self
                    .api
                    .url_with_query(&path, pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
                Ok(HttpRequest::new(scope.method(), url.as_str()))
            }
            method => {
                let url = self.api.url(&path)?;
                Ok(HttpRequest::new(method, url.as_str()).json(&parameters)?)
            }
        }
    }

    /// Send and return the successful response.
    #[instrument(skip(self, scope), fields(path = %scope.path()))]
    pub async fn send(&self, scope: &dyn ApiScope) -> Result<HttpResponse> {
        let request = self.build_request(scope)?;
        let response = self.http_client.execute(request).await?;

        if !response.is_success() {
            let error: TransferError = provider_error(&response).into();
            warn!(status = response.status, code = error.code(), "API request failed");
            return Err(error);
        }

        debug!(status = response.status, "API request succeeded");
        Ok(response)
    }

    pub async fn call<T: DeserializeOwned>(&self, scope: &dyn ApiScope) -> Result<T> {
        let response = self.send(scope).await?;
        Ok(response.json()?)
    }
}
