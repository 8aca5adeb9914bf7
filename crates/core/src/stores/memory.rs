use crate::error::{Result, SweepError};
use crate::traits::{matches_filter, rank_order, Metadata, MetadataFilter, ScoredPoint, VectorRecord, VectorStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug)]
struct Collection {
    dimensions: usize,
    points: BTreeMap<String, (Vec<f32>, Metadata)>,
}

/// In-process store with exact cosine search.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> Option<usize> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|stored| stored.points.len())
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn cosine(left: &[f32], right: &[f32]) -> f64 {
    let (mut dot, mut left_norm, mut right_norm) = (0f64, 0f64, 0f64);
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        dot / (left_norm.sqrt() * right_norm.sqrt())
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };

        let mut collections = self.collections.write().await;
        let dimensions = collections
            .get(collection)
            .map_or(first.vector.len(), |stored| stored.dimensions);

        if let Some(record) = records
            .iter()
            .find(|record| record.vector.len() != dimensions)
        {
            return Err(SweepError::InvalidArgument(format!(
                "vector {} has {} dimensions, collection {} expects {}",
                record.id,
                record.vector.len(),
                collection,
                dimensions
            )));
        }

        let stored = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dimensions,
                points: BTreeMap::new(),
            });

        for record in records {
            stored
                .points
                .insert(record.id.clone(), (record.vector.clone(), record.metadata.clone()));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>> {
        if top_k == 0 {
            return Err(SweepError::InvalidArgument("top_k must be at least 1".to_string()));
        }

        let collections = self.collections.read().await;
        let stored = collections
            .get(collection)
            .ok_or_else(|| SweepError::CollectionNotFound(collection.to_string()))?;

        if query.len() != stored.dimensions {
            return Err(SweepError::InvalidArgument(format!(
                "query vector dim {} is not {}",
                query.len(),
                stored.dimensions
            )));
        }

        let mut scored: Vec<ScoredPoint> = stored
            .points
            .iter()
            .filter(|(_, (_, metadata))| matches_filter(metadata, filter))
            .map(|(id, (vector, _))| ScoredPoint {
                id: id.clone(),
                score: cosine(query, vector),
            })
            .collect();

        scored.sort_by(rank_order);
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collections.write().await.remove(collection);
        Ok(())
    }
}
