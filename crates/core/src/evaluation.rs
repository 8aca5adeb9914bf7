use crate::embeddings::{Embedder, ModelSignatures};
use crate::error::{Result, SweepError};
use crate::metrics::{score_query, MetricAccumulator, MetricAggregate};
use crate::models::{Chunk, GoldQuery};
use crate::tokenize::normalize_for_match;
use crate::traits::{MetadataFilter, VectorStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

fn normalized_answer(query: &GoldQuery) -> Option<String> {
    query
        .reference_answer
        .as_deref()
        .map(normalize_for_match)
        .filter(|answer| !answer.is_empty())
}

/// Whether the query can be scored at all: it names relevant chunks or
/// carries a reference answer. A scorable query whose answer no chunk
/// contains is a miss, not a skip.
pub fn is_scorable(query: &GoldQuery) -> bool {
    !query.relevant_chunk_ids.is_empty() || normalized_answer(query).is_some()
}

/// Relevant chunks of one configuration's corpus for a gold query.
///
/// Explicit chunk ids win. Otherwise the earliest chunk, in corpus order,
/// whose normalized text contains the normalized reference answer.
pub fn relevant_chunk_ids(query: &GoldQuery, corpus: &[Chunk]) -> BTreeSet<String> {
    if !query.relevant_chunk_ids.is_empty() {
        return query.relevant_chunk_ids.iter().cloned().collect();
    }

    let Some(answer) = normalized_answer(query) else {
        return BTreeSet::new();
    };
    corpus
        .iter()
        .find(|chunk| normalize_for_match(&chunk.text).contains(&answer))
        .map(|chunk| chunk.chunk_id.clone())
        .into_iter()
        .collect()
}

#[derive(Debug, Clone)]
pub struct EvaluationHarness {
    top_k: usize,
    filter: MetadataFilter,
    signatures: Option<Arc<ModelSignatures>>,
}

impl EvaluationHarness {
    pub fn new(top_k: usize) -> Result<Self> {
        if top_k == 0 {
            return Err(SweepError::InvalidArgument("top_k must be at least 1".to_string()));
        }
        Ok(Self {
            top_k,
            filter: MetadataFilter::new(),
            signatures: None,
        })
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_signatures(mut self, signatures: Arc<ModelSignatures>) -> Self {
        self.signatures = Some(signatures);
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// One embedding call and one search per query; the store is only read.
    pub async fn evaluate<S, E>(
        &self,
        queries: &[GoldQuery],
        store: &S,
        embedder: &E,
        collection: &str,
        corpus: &[Chunk],
    ) -> Result<MetricAggregate>
    where
        S: VectorStore + ?Sized,
        E: Embedder + ?Sized,
    {
        let texts: HashMap<&str, &str> = corpus
            .iter()
            .map(|chunk| (chunk.chunk_id.as_str(), chunk.text.as_str()))
            .collect();
        let mut accumulator = MetricAccumulator::new(self.top_k);

        for query in queries {
            let relevant = relevant_chunk_ids(query, corpus);

            let started = Instant::now();
            let vector = embedder.embed_query(&query.question).await?;
            if let Some(signatures) = &self.signatures {
                signatures.record(embedder.model(), vector.len())?;
            }
            let hits = store
                .search(collection, &vector, self.top_k, &self.filter)
                .await?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let retrieved: Vec<String> = hits.into_iter().map(|hit| hit.id).collect();
            let top_text = retrieved
                .first()
                .and_then(|id| texts.get(id.as_str()).copied());
            let metrics = score_query(
                &retrieved,
                &relevant,
                self.top_k,
                top_text,
                query.reference_answer.as_deref(),
            );
            debug!(
                query = %query.id,
                relevant = relevant.len(),
                first_relevant_rank = ?metrics.first_relevant_rank,
                latency_ms,
                "gold query scored"
            );

            accumulator.add(
                &metrics,
                is_scorable(query),
                query.category.as_deref(),
                latency_ms,
            );
        }

        Ok(accumulator.finish())
    }
}
