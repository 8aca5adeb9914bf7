use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, String>;

/// Conjunction of exact-match metadata constraints. Empty matches everything.
pub type MetadataFilter = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;

    /// Top `top_k` records by similarity, best first; equal scores are
    /// ordered by ascending id.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;
}

pub fn matches_filter(metadata: &Metadata, filter: &MetadataFilter) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

pub fn rank_order(left: &ScoredPoint, right: &ScoredPoint) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| left.id.cmp(&right.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_are_conjunctive() {
        let metadata: Metadata = [("strategy", "fixed_token"), ("document_id", "a")]
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let mut filter = MetadataFilter::new();
        assert!(matches_filter(&metadata, &filter));
        filter.insert("strategy".to_string(), "fixed_token".to_string());
        assert!(matches_filter(&metadata, &filter));
        filter.insert("document_id".to_string(), "b".to_string());
        assert!(!matches_filter(&metadata, &filter));
    }

    #[test]
    fn ties_break_by_id() {
        let mut points = vec![
            ScoredPoint { id: "c".to_string(), score: 0.5 },
            ScoredPoint { id: "a".to_string(), score: 0.5 },
            ScoredPoint { id: "b".to_string(), score: 0.9 },
        ];
        points.sort_by(rank_order);
        let ids: Vec<_> = points.iter().map(|point| point.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
