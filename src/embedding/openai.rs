//! OpenAI embedding provider implementation.
//!
//! Calls an OpenAI-compatible `/embeddings` endpoint. Each call is a single
//! attempt; retries, backoff and rate limiting live in
//! [`EmbeddingService`](super::service::EmbeddingService) so that every
//! provider gets the same policy.

use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default embedding model.
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// Remote embedding provider for OpenAI-compatible APIs.
#[derive(Debug, Clone)]
pub struct OpenAIEmbedding {
    /// HTTP client with authorization headers preset
    client: Client,

    /// Full URL of the embeddings endpoint
    endpoint: String,

    /// Model identifier (e.g., "text-embedding-3-small")
    model: String,

    /// Dimension of the embedding vectors
    embedding_dimension: usize,

    /// Requested output dimension, for models that support shortening
    requested_dimensions: Option<usize>,
}

/// Native output dimension of the known OpenAI models.
fn native_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

impl OpenAIEmbedding {
    /// Create a new OpenAI embedding provider.
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API key
    /// * `model` - Model name (defaults to "text-embedding-3-small" if None)
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if the key is empty or the HTTP
    /// client cannot be built
    pub fn new(api_key: String, model: Option<String>) -> EmbeddingResult<Self> {
        Self::with_options(api_key, model, DEFAULT_BASE_URL, None, Duration::from_secs(30))
    }

    /// Create a provider with a custom endpoint, output dimension and timeout.
    pub fn with_options(
        api_key: String,
        model: Option<String>,
        base_url: &str,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> EmbeddingResult<Self> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::ConfigError("missing OpenAI API key".to_string()));
        }
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| EmbeddingError::ConfigError("invalid OpenAI API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                EmbeddingError::ConfigError(format!("failed to build OpenAI HTTP client: {}", e))
            })?;

        let embedding_dimension = dimensions.unwrap_or_else(|| native_dimension(&model));
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            embedding_dimension,
            requested_dimensions: dimensions,
        })
    }

    fn classify_status(status: StatusCode, body: String) -> EmbeddingError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            EmbeddingError::RateLimited(body)
        } else if status.is_server_error() {
            EmbeddingError::ApiError(format!("{}: {}", status, body))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            EmbeddingError::ConfigError(format!("{}: {}", status, body))
        } else {
            EmbeddingError::InvalidInput(format!("{}: {}", status, body))
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(
                "All texts must be non-empty".to_string(),
            ));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dimensions,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::ApiError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(Self::classify_status(status, body));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ApiError(format!("failed to parse response: {}", e)))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::ApiError(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}
