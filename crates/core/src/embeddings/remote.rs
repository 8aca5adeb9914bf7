use super::Embedder;
use crate::error::{Result, SweepError};
use crate::models::Chunk;
use crate::retry::RetryPolicy;
use crate::tokenize::Tokenizer;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::Duration;
use url::Url;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSettings {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub price_per_1k_tokens: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "expected_batch_latency_ms", default = "default_batch_latency")]
    pub expected_batch_latency: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_batch_size() -> usize {
    64
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_latency() -> Duration {
    Duration::from_millis(400)
}

impl RemoteSettings {
    pub fn validate(&self, name: &str) -> Result<()> {
        Url::parse(&self.endpoint).map_err(|error| {
            SweepError::Configuration(format!("model {name}: bad endpoint {}: {error}", self.endpoint))
        })?;
        if self.dimensions == 0 || self.batch_size == 0 {
            return Err(SweepError::Configuration(format!(
                "model {name}: dimensions and batch_size must be at least 1"
            )));
        }
        if !self.price_per_1k_tokens.is_finite() || self.price_per_1k_tokens < 0.0 {
            return Err(SweepError::Configuration(format!(
                "model {name}: price_per_1k_tokens must be a non-negative number"
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait EmbeddingTransport: Send + Sync {
    async fn embed_batch(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// `POST {endpoint}/embeddings` in the OpenAI wire format.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_settings(settings: &RemoteSettings) -> Result<Self> {
        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|variable| std::env::var(variable).ok());
        Self::new(&settings.endpoint, api_key, settings.request_timeout)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl EmbeddingTransport for HttpTransport {
    async fn embed_batch(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&json!({ "model": model, "input": inputs }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if is_transient_status(status) {
            return Err(SweepError::Transient {
                backend: model.to_string(),
                details: status.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SweepError::BackendResponse {
                backend: model.to_string(),
                details: status.to_string(),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|datum| datum.index);
        Ok(parsed.data.into_iter().map(|datum| datum.embedding).collect())
    }
}

/// Embedder for a priced HTTP provider. Requests are split into batches of
/// `batch_size`; each batch is retried under the configured policy.
pub struct RemoteEmbedder<T = HttpTransport> {
    name: String,
    settings: RemoteSettings,
    transport: T,
    tokenizer: &'static Tokenizer,
}

impl<T: EmbeddingTransport> RemoteEmbedder<T> {
    pub fn new(name: impl Into<String>, settings: RemoteSettings, transport: T) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            settings,
            transport,
            tokenizer: Tokenizer::shared()?,
        })
    }

    fn batches(&self, count: usize) -> usize {
        count.div_ceil(self.settings.batch_size.max(1))
    }
}

#[async_trait]
impl<T: EmbeddingTransport> Embedder for RemoteEmbedder<T> {
    fn model(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.settings.batch_size.max(1)) {
            let embedded = self
                .settings
                .retry
                .run(&self.name, || self.transport.embed_batch(&self.name, batch))
                .await?;
            if embedded.len() != batch.len() {
                return Err(SweepError::BackendResponse {
                    backend: self.name.clone(),
                    details: format!("{} vectors for a batch of {}", embedded.len(), batch.len()),
                });
            }
            if let Some(odd) = embedded
                .iter()
                .find(|vector| vector.len() != self.settings.dimensions)
            {
                return Err(SweepError::ModelDrift {
                    model: self.name.clone(),
                    expected: self.settings.dimensions,
                    actual: odd.len(),
                });
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    fn estimate_cost(&self, chunks: &[Chunk]) -> f64 {
        let tokens: usize = chunks
            .iter()
            .map(|chunk| self.tokenizer.count(&chunk.text))
            .sum();
        tokens as f64 / 1000.0 * self.settings.price_per_1k_tokens
    }

    fn estimate_latency(&self, chunks: &[Chunk]) -> Duration {
        self.settings.expected_batch_latency * self.batches(chunks.len()) as u32
    }
}
