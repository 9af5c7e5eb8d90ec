use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::types::{FailureKind, RemoteError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_bytes: u64,
    /// Sent as a bearer token when set.
    pub access_token: Option<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_bytes: 16 * 1024 * 1024,
            access_token: None,
        }
    }
}

/// JSON access to the remote collection API.
#[async_trait::async_trait]
pub trait CollectionClient: Send + Sync {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Value, RemoteError>;

    async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError>;

    /// Like `get`, but a 404 is an absent resource rather than an error.
    async fn get_optional(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Option<Value>, RemoteError> {
        match self.get(path, params).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestCollectionClient {
    base_url: Url,
    client: reqwest::Client,
    settings: FetchSettings,
}

impl ReqwestCollectionClient {
    pub fn new(base_url: &str, settings: FetchSettings) -> Result<Self, RemoteError> {
        // Paths are joined relative to the base, which only keeps its last
        // segment with a trailing slash.
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&base_url)
            .map_err(|err| RemoteError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|err| RemoteError::new(FailureKind::Network, err.to_string()))?;
        Ok(Self {
            base_url,
            client,
            settings,
        })
    }

    fn url(&self, path: &str, params: &[(String, String)]) -> Result<Url, RemoteError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| RemoteError::new(FailureKind::InvalidUrl, err.to_string()))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, RemoteError> {
        let request = match &self.settings.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::new(
                FailureKind::HttpStatus(status.as_u16()),
                format!("{} from {}", status, response.url()),
            ));
        }

        let max_bytes = self.settings.max_bytes;
        if let Some(content_len) = response.content_length() {
            if content_len > max_bytes {
                return Err(RemoteError::new(
                    FailureKind::TooLarge {
                        max_bytes,
                        actual: Some(content_len),
                    },
                    "response too large",
                ));
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > max_bytes {
                return Err(RemoteError::new(
                    FailureKind::TooLarge {
                        max_bytes,
                        actual: Some(next_len),
                    },
                    "response too large",
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        serde_json::from_slice(&bytes)
            .map_err(|err| RemoteError::new(FailureKind::MalformedBody, err.to_string()))
    }
}

#[async_trait::async_trait]
impl CollectionClient for ReqwestCollectionClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Value, RemoteError> {
        let url = self.url(path, params)?;
        self.send(self.client.get(url)).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        let url = self.url(path, &[])?;
        let body = serde_json::to_vec(body)
            .map_err(|err| RemoteError::new(FailureKind::MalformedBody, err.to_string()))?;
        self.send(
            self.client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::new(FailureKind::Timeout, err.to_string());
    }
    RemoteError::new(FailureKind::Network, err.to_string())
}
