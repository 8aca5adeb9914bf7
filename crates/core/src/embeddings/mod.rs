pub mod local;
pub mod remote;

pub use local::{LocalEmbedder, LocalModel, SubwordHashModel, DEFAULT_EMBEDDING_DIMENSIONS};
pub use remote::{EmbeddingTransport, HttpTransport, RemoteEmbedder, RemoteSettings};

use crate::error::{Result, SweepError};
use crate::models::{Chunk, EmbeddingVector};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn estimate_cost(&self, chunks: &[Chunk]) -> f64;

    fn estimate_latency(&self, chunks: &[Chunk]) -> Duration;

    /// Embed chunks, aligned 1:1 with the input. All vectors of one call
    /// share a dimensionality.
    async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<EmbeddingVector>> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self.embed_texts(&texts).await?;

        if vectors.len() != chunks.len() {
            return Err(SweepError::BackendResponse {
                backend: self.model().to_string(),
                details: format!(
                    "embedding count {} doesn't match chunk count {}",
                    vectors.len(),
                    chunks.len()
                ),
            });
        }

        if let Some(first) = vectors.first() {
            if let Some(odd) = vectors.iter().find(|vector| vector.len() != first.len()) {
                return Err(SweepError::ModelDrift {
                    model: self.model().to_string(),
                    expected: first.len(),
                    actual: odd.len(),
                });
            }
        }

        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, values)| EmbeddingVector {
                chunk_id: chunk.chunk_id.clone(),
                model: self.model().to_string(),
                values,
            })
            .collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SweepError::BackendResponse {
                backend: self.model().to_string(),
                details: "no vector returned for query".to_string(),
            })
    }
}

/// Dimensionality fixed for each model, either declared up front with
/// [`ModelSignatures::declare`] or taken from the first vector seen. Later
/// vectors of a different length are reported as drift.
#[derive(Debug, Default)]
pub struct ModelSignatures {
    dimensions: DashMap<String, usize>,
}

impl ModelSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, dimensions: usize) -> Result<()> {
        match self.dimensions.entry(model.to_string()) {
            Entry::Occupied(entry) if *entry.get() != dimensions => Err(SweepError::ModelDrift {
                model: model.to_string(),
                expected: *entry.get(),
                actual: dimensions,
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(dimensions);
                Ok(())
            }
        }
    }

    pub fn declare(&self, embedder: &dyn Embedder) -> Result<()> {
        self.record(embedder.model(), embedder.dimensions())
    }

    pub fn check_all(&self, model: &str, vectors: &[EmbeddingVector]) -> Result<()> {
        vectors
            .iter()
            .try_for_each(|vector| self.record(model, vector.values.len()))
    }

    pub fn get(&self, model: &str) -> Option<usize> {
        self.dimensions.get(model).map(|entry| *entry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendSpec {
    Remote(RemoteSettings),
    Local {
        #[serde(default = "default_local_dimensions")]
        dimensions: usize,
    },
}

fn default_local_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    #[serde(flatten)]
    pub backend: BackendSpec,
}

#[derive(Clone, Default)]
pub struct EmbedderCatalog {
    embedders: BTreeMap<String, Arc<dyn Embedder>>,
}

impl EmbedderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[ModelSpec]) -> Result<Self> {
        let mut catalog = Self::new();
        for spec in specs {
            let embedder: Arc<dyn Embedder> = match &spec.backend {
                BackendSpec::Remote(settings) => {
                    let transport = HttpTransport::from_settings(settings)?;
                    Arc::new(RemoteEmbedder::new(&spec.name, settings.clone(), transport)?)
                }
                BackendSpec::Local { dimensions } => Arc::new(LocalEmbedder::new(
                    &spec.name,
                    SubwordHashModel::new(*dimensions),
                )?),
            };
            catalog.insert(embedder);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, embedder: Arc<dyn Embedder>) {
        self.embedders.insert(embedder.model().to_string(), embedder);
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn Embedder>> {
        self.embedders.get(model).cloned()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.embedders.contains_key(model)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.embedders.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkParams;

    struct Ragged;

    #[async_trait]
    impl Embedder for Ragged {
        fn model(&self) -> &str {
            "ragged"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(index, _)| vec![0.5; 2 + index])
                .collect())
        }

        fn estimate_cost(&self, _chunks: &[Chunk]) -> f64 {
            0.0
        }

        fn estimate_latency(&self, _chunks: &[Chunk]) -> Duration {
            Duration::ZERO
        }
    }

    fn chunk(id: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            document_id: "doc".to_string(),
            sequence: 0,
            start_token: 0,
            end_token: 1,
            text: id.to_string(),
            strategy: "fixed_token".to_string(),
            params: ChunkParams::fixed(1),
        }
    }

    #[test]
    fn signatures_flag_drift() {
        let signatures = ModelSignatures::new();
        assert!(signatures.record("m", 384).is_ok());
        assert!(signatures.record("m", 384).is_ok());
        assert!(matches!(
            signatures.record("m", 768),
            Err(SweepError::ModelDrift { expected: 384, actual: 768, .. })
        ));
        assert_eq!(signatures.get("m"), Some(384));
        assert_eq!(signatures.get("other"), None);
    }

    #[tokio::test]
    async fn declared_dimensions_catch_a_provider_mismatch() -> Result<()> {
        let signatures = ModelSignatures::new();
        signatures.declare(&Ragged)?;
        let vectors = Ragged.embed(&[chunk("wide")]).await?;
        assert!(signatures.check_all("ragged", &vectors).is_ok());
        assert!(matches!(
            signatures.record("ragged", 3),
            Err(SweepError::ModelDrift { expected: 2, actual: 3, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn mixed_dimensions_in_one_call_are_drift() {
        let result = Ragged.embed(&[chunk("a"), chunk("b")]).await;
        assert!(matches!(result, Err(SweepError::ModelDrift { expected: 2, actual: 3, .. })));
    }

    #[tokio::test]
    async fn single_chunk_keeps_its_id() -> Result<()> {
        let vectors = Ragged.embed(&[chunk("only")]).await?;
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].chunk_id, "only");
        assert_eq!(vectors[0].model, "ragged");
        Ok(())
    }

    #[test]
    fn model_specs_parse_tagged_backends() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let specs: Vec<ModelSpec> = serde_json::from_str(
            r#"[
                {"name": "hash-64", "backend": "local", "dimensions": 64},
                {"name": "text-embedding-3-small", "backend": "remote",
                 "endpoint": "https://api.openai.com/v1", "dimensions": 1536,
                 "price_per_1k_tokens": 0.00002}
            ]"#,
        )?;
        assert_eq!(specs[0].backend, BackendSpec::Local { dimensions: 64 });
        assert!(matches!(&specs[1].backend, BackendSpec::Remote(settings) if settings.batch_size == 64));

        let catalog = EmbedderCatalog::from_specs(&specs[..1])?;
        assert!(catalog.contains("hash-64"));
        assert_eq!(catalog.get("hash-64").map(|embedder| embedder.dimensions()), Some(64));
        Ok(())
    }
}
