use crate::error::{Result, SweepError};
use crate::models::{Chunk, ChunkParams, Document};
use crate::tokenize::{join_pieces, split_sentences, Tokenizer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FixedToken,
    SlidingWindow,
    SentenceAware,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::FixedToken,
        StrategyKind::SlidingWindow,
        StrategyKind::SentenceAware,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::FixedToken => "fixed_token",
            Self::SlidingWindow => "sliding_window",
            Self::SentenceAware => "sentence_aware",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| SweepError::UnknownStrategy(name.to_string()))
    }

    pub fn normalize(self, params: ChunkParams) -> ChunkParams {
        match self {
            Self::FixedToken => ChunkParams::fixed(params.chunk_size),
            Self::SlidingWindow => ChunkParams::sliding(params.chunk_size, params.overlap),
            Self::SentenceAware => ChunkParams::sentences(params.max_tokens),
        }
    }

    pub fn validate(self, params: &ChunkParams) -> Result<()> {
        match self {
            Self::FixedToken | Self::SlidingWindow if params.chunk_size == 0 => Err(
                SweepError::Configuration(format!("{}: chunk_size must be at least 1", self)),
            ),
            Self::SlidingWindow if params.overlap >= params.chunk_size => {
                Err(SweepError::Configuration(format!(
                    "{}: overlap {} must be smaller than chunk_size {}",
                    self, params.overlap, params.chunk_size
                )))
            }
            Self::SentenceAware if params.max_tokens == 0 => Err(SweepError::Configuration(
                format!("{}: max_tokens must be at least 1", self),
            )),
            _ => Ok(()),
        }
    }

    /// Split `document` into ordered chunks. Deterministic for a fixed
    /// `(document, params)`.
    pub fn chunk(self, document: &Document, params: &ChunkParams) -> Result<Vec<Chunk>> {
        self.validate(params)?;
        let params = self.normalize(*params);
        let tokens = Tokenizer::shared()?.pieces(&document.text);

        let ranges = match self {
            Self::FixedToken => fixed_token_ranges(tokens.len(), params.chunk_size),
            Self::SlidingWindow => {
                sliding_window_ranges(tokens.len(), params.chunk_size, params.overlap)
            }
            Self::SentenceAware => sentence_ranges(&tokens, params.max_tokens),
        };

        Ok(ranges
            .into_iter()
            .enumerate()
            .map(|(sequence, range)| Chunk {
                chunk_id: make_chunk_id(&document.id, self.name(), &params, sequence),
                document_id: document.id.clone(),
                sequence,
                start_token: range.start,
                end_token: range.end,
                text: join_pieces(&tokens[range]),
                strategy: self.name().to_string(),
                params,
            })
            .collect())
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn fixed_token_ranges(total: usize, chunk_size: usize) -> Vec<Range<usize>> {
    (0..total)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(total))
        .collect()
}

/// Windows advance by `chunk_size - overlap` and stop at the first window
/// that reaches the end, so the last window may be shorter.
fn sliding_window_ranges(total: usize, chunk_size: usize, overlap: usize) -> Vec<Range<usize>> {
    let stride = chunk_size - overlap;
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < total {
        let end = (start + chunk_size).min(total);
        ranges.push(start..end);
        if end == total {
            break;
        }
        start += stride;
    }

    ranges
}

/// Greedy packing of whole sentences. A sentence longer than `max_tokens`
/// becomes its own chunk instead of being cut.
fn sentence_ranges(tokens: &[String], max_tokens: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for sentence in split_sentences(tokens) {
        current = match current {
            None => Some(sentence),
            Some(open) if open.len() + sentence.len() <= max_tokens => {
                Some(open.start..sentence.end)
            }
            Some(open) => {
                ranges.push(open);
                Some(sentence)
            }
        };
    }

    ranges.extend(current);
    ranges
}

fn make_chunk_id(document_id: &str, strategy: &str, params: &ChunkParams, sequence: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0]);
    hasher.update(strategy.as_bytes());
    hasher.update((params.chunk_size as u64).to_le_bytes());
    hasher.update((params.overlap as u64).to_le_bytes());
    hasher.update((params.max_tokens as u64).to_le_bytes());
    hasher.update((sequence as u64).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkStats {
    pub chunks: usize,
    pub documents: usize,
    pub mean_tokens_per_chunk: f64,
    pub max_chunks_per_document: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut per_document: HashMap<&str, usize> = HashMap::new();
        let mut tokens = 0usize;
        for chunk in chunks {
            *per_document.entry(chunk.document_id.as_str()).or_default() += 1;
            tokens += chunk.token_len();
        }

        Self {
            chunks: chunks.len(),
            documents: per_document.len(),
            mean_tokens_per_chunk: if chunks.is_empty() {
                0.0
            } else {
                tokens as f64 / chunks.len() as f64
            },
            max_chunks_per_document: per_document.values().copied().max().unwrap_or(0),
        }
    }
}
