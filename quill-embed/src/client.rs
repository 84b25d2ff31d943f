//! Embedding Client: unified interface for OpenAI-compatible and Ollama
//! embedding endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use quill_core::config::EmbeddingConfig;
use quill_core::embedding::EmbeddingService;
use quill_core::{Embedding, QuillError};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::EmbedError;

/// Text embedded by [`HttpEmbeddingClient::test_connection`].
const PROBE_TEXT: &str = "connection test";

/// Base delay between retries; doubles per attempt.
const RETRY_BACKOFF_MS: u64 = 250;

/// Provider backend for embedding requests.
#[derive(Debug, Clone)]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/v1/embeddings` (DashScope, vLLM, LM Studio, ...).
    OpenAiCompatible {
        /// Base URL without the `/v1` suffix.
        base_url: String,
        /// Bearer token; empty for servers without auth.
        api_key: String,
    },
    /// Ollama's `/api/embed`.
    Ollama {
        /// Base URL of the Ollama server.
        base_url: String,
    },
    /// No backend; every call fails and the knowledge base stays keyword-only.
    None,
}

/// Embedding client that routes requests to the configured backend.
pub struct HttpEmbeddingClient {
    provider: EmbeddingProvider,
    http: Client,
    model: String,
    dimensions: usize,
    max_retries: u32,
    timeout_ms: u64,
}

impl HttpEmbeddingClient {
    /// Create a client.
    #[must_use]
    pub fn new(
        provider: EmbeddingProvider,
        model: impl Into<String>,
        dimensions: usize,
        max_retries: u32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            provider,
            http: Client::new(),
            model: model.into(),
            dimensions,
            max_retries,
            timeout_ms,
        }
    }

    /// Build a client from the `[embedding]` configuration section.
    ///
    /// The API key is read from the environment variable named by
    /// `api_key_env`; a missing variable means no `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::ConfigError`] for an unknown provider name.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let provider = match config.provider.to_ascii_lowercase().as_str() {
            "openai" => EmbeddingProvider::OpenAiCompatible {
                base_url,
                api_key: std::env::var(&config.api_key_env).unwrap_or_default(),
            },
            "ollama" => EmbeddingProvider::Ollama { base_url },
            "none" => EmbeddingProvider::None,
            other => {
                return Err(EmbedError::ConfigError(format!(
                    "unknown embedding provider '{other}'"
                )));
            }
        };
        Ok(Self::new(
            provider,
            config.model.clone(),
            config.dimensions,
            config.max_retries,
            config.request_timeout_ms,
        ))
    }

    /// Create a client with no backend.
    #[must_use]
    pub fn none() -> Self {
        Self::new(EmbeddingProvider::None, String::new(), 0, 0, 0)
    }

    /// Check if a backend is configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.provider, EmbeddingProvider::None)
    }

    /// Embed a probe text and check the returned dimensionality.
    ///
    /// Returns the dimensionality on success.
    ///
    /// # Errors
    ///
    /// Returns the request error, or [`EmbedError::DimensionMismatch`] if
    /// the service does not produce vectors of the configured size.
    pub async fn test_connection(&self) -> Result<usize, EmbedError> {
        if !self.is_available() {
            return Err(EmbedError::Unavailable("no embedding provider configured".into()));
        }
        let start = Instant::now();
        let vectors = self.request(&[PROBE_TEXT.to_string()]).await?;
        let actual = vectors.first().map_or(0, Vec::len);
        if actual != self.dimensions {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimensions,
                actual,
            });
        }
        info!(
            model = %self.model,
            dimensions = actual,
            latency_ms = start.elapsed().as_millis(),
            "embedding service reachable"
        );
        Ok(actual)
    }

    /// Embed `texts` with one request per attempt.
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let (url, body, api_key) = match &self.provider {
            EmbeddingProvider::None => {
                return Err(EmbedError::Unavailable("no embedding provider configured".into()));
            }
            EmbeddingProvider::OpenAiCompatible { base_url, api_key } => (
                format!("{base_url}/v1/embeddings"),
                openai_body(&self.model, texts, self.dimensions),
                Some(api_key.as_str()).filter(|k| !k.is_empty()),
            ),
            EmbeddingProvider::Ollama { base_url } => (
                format!("{base_url}/api/embed"),
                ollama_body(&self.model, texts),
                None,
            ),
        };

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = RETRY_BACKOFF_MS.saturating_mul(1 << (attempt - 1).min(6));
                debug!(
                    attempt = attempt + 1,
                    of = self.max_retries + 1,
                    delay_ms = delay,
                    "retrying embedding request"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.send_once(&url, &body, api_key, texts.len()).await {
                Ok(vectors) => return Ok(vectors),
                // Malformed responses will not improve on retry.
                Err(err @ EmbedError::ParseError(_)) => return Err(err),
                Err(err) => {
                    warn!(url = %url, error = %err, "embedding request failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(EmbedError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }

    async fn send_once(
        &self,
        url: &str,
        body: &Value,
        api_key: Option<&str>,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let start = Instant::now();
        let mut request = self
            .http
            .post(url)
            .json(body)
            .timeout(Duration::from_millis(self.timeout_ms));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbedError::Timeout(self.timeout_ms)
            } else {
                EmbedError::from(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EmbedError::Http {
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| EmbedError::ParseError(e.to_string()))?;
        let vectors = match self.provider {
            EmbeddingProvider::Ollama { .. } => parse_ollama_response(&json, expected)?,
            _ => parse_openai_response(&json, expected)?,
        };
        debug!(
            count = vectors.len(),
            latency_ms = start.elapsed().as_millis(),
            "embedding response received"
        );
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> quill_core::error::Result<Embedding> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .map(Embedding)
            .ok_or_else(|| QuillError::EmbeddingUnavailable("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> quill_core::error::Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(texts).await?;
        Ok(vectors.into_iter().map(Embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

fn openai_body(model: &str, texts: &[String], dimensions: usize) -> Value {
    let mut body = json!({
        "model": model,
        "input": texts,
        "encoding_format": "float",
    });
    if dimensions > 0 {
        body["dimensions"] = json!(dimensions);
    }
    body
}

fn ollama_body(model: &str, texts: &[String]) -> Value {
    json!({
        "model": model,
        "input": texts,
    })
}

/// `{"data": [{"index": 0, "embedding": [...]}, ...]}`, reordered by index.
fn parse_openai_response(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json["data"]
        .as_array()
        .ok_or_else(|| EmbedError::ParseError("missing 'data' array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item["index"]
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(position);
        indexed.push((index, parse_vector(&item["embedding"])?));
    }
    indexed.sort_by_key(|(i, _)| *i);

    let vectors: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();
    check_count(vectors, expected)
}

/// `{"embeddings": [[...], ...]}`.
fn parse_ollama_response(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json["embeddings"]
        .as_array()
        .ok_or_else(|| EmbedError::ParseError("missing 'embeddings' array".into()))?;
    let vectors = data.iter().map(parse_vector).collect::<Result<Vec<_>, _>>()?;
    check_count(vectors, expected)
}

#[allow(clippy::cast_possible_truncation)]
fn parse_vector(value: &Value) -> Result<Vec<f32>, EmbedError> {
    let values = value
        .as_array()
        .ok_or_else(|| EmbedError::ParseError("embedding is not an array".into()))?;
    if values.is_empty() {
        return Err(EmbedError::ParseError("empty embedding".into()));
    }
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbedError::ParseError(format!("non-numeric component {v}")))
        })
        .collect()
}

fn check_count(vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
    if vectors.len() == expected {
        Ok(vectors)
    } else {
        Err(EmbedError::ParseError(format!(
            "expected {expected} embeddings, got {}",
            vectors.len()
        )))
    }
}
