use crate::chunking::ChunkStats;
use crate::metrics::MetricAggregate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub origin: String,
    pub format: String,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub content_hash: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>, metadata: DocumentMetadata) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            content_hash: content_hash(&text),
            text,
            metadata,
        }
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Strategy parameters. Fields a strategy ignores are zeroed by
/// [`crate::StrategyKind::normalize`].
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ChunkParams {
    #[serde(default)]
    pub chunk_size: usize,
    #[serde(default)]
    pub overlap: usize,
    #[serde(default)]
    pub max_tokens: usize,
}

impl ChunkParams {
    pub fn fixed(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn sliding(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            max_tokens: 0,
        }
    }

    pub fn sentences(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }
}

impl fmt::Display for ChunkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} overlap={} max_tokens={}",
            self.chunk_size, self.overlap, self.max_tokens
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence: usize,
    pub start_token: usize,
    pub end_token: usize,
    pub text: String,
    pub strategy: String,
    pub params: ChunkParams,
}

impl Chunk {
    pub fn token_len(&self) -> usize {
        self.end_token - self.start_token
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub model: String,
    pub values: Vec<f32>,
}

/// A question with its known-correct evidence. Shared read-only by every
/// configuration of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoldQuery {
    #[serde(default)]
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub relevant_chunk_ids: Vec<String>,
    #[serde(default)]
    pub reference_answer: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Configuration {
    pub strategy: String,
    pub params: ChunkParams,
    pub model: String,
}

impl Configuration {
    pub fn new(strategy: impl Into<String>, params: ChunkParams, model: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            params,
            model: model.into(),
        }
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.strategy.as_bytes());
        hasher.update([0]);
        hasher.update((self.params.chunk_size as u64).to_le_bytes());
        hasher.update((self.params.overlap as u64).to_le_bytes());
        hasher.update((self.params.max_tokens as u64).to_le_bytes());
        hasher.update(self.model.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn collection_name(&self) -> String {
        format!("sweep_{}", &self.fingerprint()[..16])
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) @ {}", self.strategy, self.params, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub configuration: Configuration,
    pub metrics: MetricAggregate,
    pub corpus_cost: f64,
    pub cost_per_10k_docs: f64,
    /// Mean measured query latency: query embedding plus search.
    pub latency_ms: f64,
    /// Embedder's estimate for embedding the whole corpus.
    pub indexing_estimate_ms: f64,
    pub chunk_stats: ChunkStats,
}
