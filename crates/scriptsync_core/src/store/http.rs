//! HTTP client for the document server API.

use super::DocumentStore;
use crate::config::SyncConfig;
use crate::constants::DEFAULT_LIST_DOCUMENTS_LIMIT;
use crate::error::StoreError;
use crate::models::{CreateDocumentRequest, DocumentId, DocumentRecord, UpdateDocumentRequest};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`DocumentStore`] backed by the scriptsync server.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpStore {
    /// Build a store for `server_url` with its own HTTP client.
    ///
    /// # Errors
    /// Returns [`StoreError::Network`] when the URL is unusable or the client
    /// cannot be constructed.
    pub fn new(server_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| StoreError::Network(format!("http client setup failed: {}", err)))?;
        Self::with_client(client, server_url, token)
    }

    /// Build a store around an existing client.
    ///
    /// # Errors
    /// Returns [`StoreError::Network`] when the URL cannot be parsed.
    pub fn with_client(
        client: reqwest::Client,
        server_url: &str,
        token: Option<String>,
    ) -> Result<Self, StoreError> {
        let base_url = Url::parse(server_url.trim()).map_err(|err| {
            StoreError::Network(format!("invalid server URL '{}': {}", server_url, err))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Network(format!(
                "server URL '{}' cannot be used as an API base",
                server_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, StoreError> {
        Self::new(&config.server_url, config.api_token.clone())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|err| StoreError::Network(err.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, StoreError> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| StoreError::InvalidResponse(format!("undecodable body: {}", err)))
    }
}

fn retry_after_from(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull a human-readable message out of an error body.
fn error_message(status: StatusCode, body: &str) -> String {
    if body.trim().is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or(body)
            .to_string();
    }
    body.to_string()
}

fn conflict_version(body: &str) -> Option<u64> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("current_version")
        .and_then(Value::as_u64)
}

async fn error_from_response(response: Response) -> StoreError {
    let status = response.status();
    let retry_after = retry_after_from(&response);
    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => format!("failed to read error response body: {}", err),
    };
    debug!(status = status.as_u16(), "store request failed: {}", body);
    classify(status, retry_after, &body)
}

fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED => StoreError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => StoreError::RateLimited { retry_after },
        StatusCode::NOT_FOUND => StoreError::NotFound,
        StatusCode::CONFLICT => match conflict_version(body) {
            Some(current_version) => StoreError::Conflict { current_version },
            None => StoreError::InvalidResponse(
                "conflict response without current_version".to_string(),
            ),
        },
        other => StoreError::Server {
            status: other.as_u16(),
            message: error_message(other, body),
        },
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let url = self.endpoint(&["api", "documents"]);
        let builder = self
            .request(Method::GET, url)
            .query(&[("limit", DEFAULT_LIST_DOCUMENTS_LIMIT)]);
        self.send_json(builder).await
    }

    async fn get(&self, id: &DocumentId) -> Result<DocumentRecord, StoreError> {
        let url = self.endpoint(&["api", "document", id.as_str()]);
        self.send_json(self.request(Method::GET, url)).await
    }

    async fn create(&self, request: &CreateDocumentRequest) -> Result<DocumentRecord, StoreError> {
        let url = self.endpoint(&["api", "document"]);
        self.send_json(self.request(Method::POST, url).json(request))
            .await
    }

    async fn update(
        &self,
        id: &DocumentId,
        request: &UpdateDocumentRequest,
    ) -> Result<DocumentRecord, StoreError> {
        let url = self.endpoint(&["api", "document", id.as_str()]);
        self.send_json(self.request(Method::PUT, url).json(request))
            .await
    }

    async fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        let url = self.endpoint(&["api", "document", id.as_str()]);
        self.send(self.request(Method::DELETE, url)).await.map(|_| ())
    }
}
