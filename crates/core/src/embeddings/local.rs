use super::Embedder;
use crate::error::Result;
use crate::models::Chunk;
use crate::tokenize::Tokenizer;
use async_trait::async_trait;
use std::iter;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

const WARM_UP_TEXTS: [&str; 4] = [
    "Hydraulic pressure is measured at the pump outlet before the relief valve opens.",
    "Retrieval quality depends on how documents are split into chunks.",
    "The operator must confirm the interlock state before resetting the controller.",
    "Short chunks improve precision while longer chunks tend to improve recall.",
];

pub trait LocalModel: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Signed feature hashing of per-word character n-grams. Words are wrapped
/// in `<` and `>` so prefixes and suffixes hash apart from inner grams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubwordHashModel {
    pub dimensions: usize,
    pub ngram: usize,
}

impl SubwordHashModel {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ngram: 3,
        }
    }
}

impl Default for SubwordHashModel {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

fn fnv1a(gram: &[char]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut buffer = [0u8; 4];
    for character in gram {
        for byte in character.encode_utf8(&mut buffer).bytes() {
            hash = (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

impl LocalModel for SubwordHashModel {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let buckets = vector.len() as u64;

        for word in text.split_whitespace() {
            let padded: Vec<char> = iter::once('<')
                .chain(word.to_lowercase().chars())
                .chain(iter::once('>'))
                .collect();
            let width = self.ngram.clamp(1, padded.len());
            for gram in padded.windows(width) {
                let hash = fnv1a(gram);
                let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
                vector[(hash % buckets) as usize] += sign;
            }
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|value| *value /= norm);
        }
        vector
    }
}

/// No per-token cost; latency is estimated from the throughput measured on
/// a warm-up batch.
pub struct LocalEmbedder {
    name: String,
    model: Box<dyn LocalModel>,
    tokenizer: &'static Tokenizer,
    tokens_per_second: f64,
}

impl LocalEmbedder {
    pub fn new(name: impl Into<String>, model: impl LocalModel + 'static) -> Result<Self> {
        let name = name.into();
        let tokenizer = Tokenizer::shared()?;
        let started = Instant::now();
        let tokens: usize = WARM_UP_TEXTS
            .iter()
            .map(|text| {
                model.embed(text);
                tokenizer.count(text)
            })
            .sum();
        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let tokens_per_second = tokens as f64 / elapsed;
        debug!(model = %name, tokens_per_second, "local model warmed up");

        Self::with_throughput(name, model, tokens_per_second)
    }

    pub fn with_throughput(
        name: impl Into<String>,
        model: impl LocalModel + 'static,
        tokens_per_second: f64,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            model: Box::new(model),
            tokenizer: Tokenizer::shared()?,
            tokens_per_second: tokens_per_second.max(f64::MIN_POSITIVE),
        })
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.model.embed(text)).collect())
    }

    fn estimate_cost(&self, _chunks: &[Chunk]) -> f64 {
        0.0
    }

    fn estimate_latency(&self, chunks: &[Chunk]) -> Duration {
        let tokens: usize = chunks
            .iter()
            .map(|chunk| self.tokenizer.count(&chunk.text))
            .sum();
        Duration::from_secs_f64(tokens as f64 / self.tokens_per_second)
    }
}
