//! Search Backend
//!
//! The search service is a black box reached through [`SearchBackend`].
//! [`ElasticsearchClient`] speaks the `_msearch` protocol over HTTP.

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use super::query::MultiSearchRequest;
use super::response::{MultiSearchResponse, SearchResponse};
use crate::config::BackendConfig;

/// A service executing multi-search requests
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Execute every header/body pair, returning one response per pair in order
    async fn msearch(&self, request: &MultiSearchRequest) -> Result<Vec<SearchResponse>, BackendError>;
}

/// Errors that can occur when talking to the search backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Search backend unavailable")]
    Unavailable,

    #[error("Request timeout")]
    Timeout,

    #[error("Rate limited")]
    RateLimited,

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    /// One item of a multi-search reported an error
    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable | Self::Timeout | Self::RateLimited => true,
            Self::ApiError { status, .. } => *status >= 500,
            Self::Request(_)
            | Self::SearchFailed(_)
            | Self::MalformedResponse(_)
            | Self::Serialization(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Request(err)
        }
    }
}

/// HTTP client for an Elasticsearch-compatible search service
pub struct ElasticsearchClient {
    client: Client,
    base_url: String,
}

impl ElasticsearchClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchClient {
    async fn msearch(&self, request: &MultiSearchRequest) -> Result<Vec<SearchResponse>, BackendError> {
        let url = format!("{}/_msearch", self.base_url);
        let body = request.to_ndjson()?;

        tracing::debug!(pairs = request.len(), "Sending multi-search to {}", url);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(BackendError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::ApiError {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: MultiSearchResponse = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        if parsed.responses.len() != request.len() {
            return Err(BackendError::MalformedResponse(format!(
                "expected {} responses, got {}",
                request.len(),
                parsed.responses.len()
            )));
        }

        parsed
            .responses
            .into_iter()
            .map(|item| match item.error {
                Some(reason) => Err(BackendError::SearchFailed(reason)),
                None => Ok(item),
            })
            .collect()
    }
}
