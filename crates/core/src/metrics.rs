//! Retrieval metrics for one query and their per-configuration aggregate.
//!
//! Ranking metrics (Recall@K, Precision@K, MRR, F1) are averaged over the
//! scorable queries, those naming relevant chunks or carrying a reference
//! answer. A scorable query with an empty relevant set scores zero. The
//! rest are counted as skipped. Exact Match is averaged over the queries
//! that carry a reference answer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryMetric {
    #[default]
    Recall,
    Mrr,
    Precision,
    F1,
    ExactMatch,
}

impl fmt::Display for PrimaryMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recall => "recall_at_k",
            Self::Mrr => "mrr",
            Self::Precision => "precision_at_k",
            Self::F1 => "f1",
            Self::ExactMatch => "exact_match",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryMetrics {
    pub recall: f64,
    pub precision: f64,
    pub reciprocal_rank: f64,
    pub f1: f64,
    pub exact_match: Option<f64>,
    pub first_relevant_rank: Option<usize>,
}

pub fn normalize_answer(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn score_query(
    retrieved: &[String],
    relevant: &BTreeSet<String>,
    top_k: usize,
    top_text: Option<&str>,
    reference_answer: Option<&str>,
) -> QueryMetrics {
    let window = &retrieved[..retrieved.len().min(top_k)];
    let distinct: HashSet<&str> = window.iter().map(String::as_str).collect();
    let hits = distinct
        .iter()
        .filter(|id| relevant.contains(**id))
        .count() as f64;

    let recall = if relevant.is_empty() {
        0.0
    } else {
        hits / relevant.len() as f64
    };
    let precision = if top_k == 0 { 0.0 } else { hits / top_k as f64 };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    let first_relevant_rank = window
        .iter()
        .position(|id| relevant.contains(id))
        .map(|position| position + 1);

    let exact_match = reference_answer.map(|answer| {
        let matched = top_text
            .map(|text| normalize_answer(text) == normalize_answer(answer))
            .unwrap_or(false);
        if matched {
            1.0
        } else {
            0.0
        }
    });

    QueryMetrics {
        recall,
        precision,
        reciprocal_rank: first_relevant_rank.map_or(0.0, |rank| 1.0 / rank as f64),
        f1,
        exact_match,
        first_relevant_rank,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryMetrics {
    pub queries: usize,
    pub recall_at_k: f64,
    pub mrr: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricAggregate {
    pub top_k: usize,
    pub recall_at_k: f64,
    pub precision_at_k: f64,
    pub mrr: f64,
    pub f1: f64,
    pub exact_match: f64,
    pub evaluated: usize,
    /// Queries with neither relevant ids nor a reference answer.
    pub skipped: usize,
    pub exact_match_evaluated: usize,
    /// Rank of the first relevant hit -> number of queries.
    pub rank_distribution: BTreeMap<usize, usize>,
    pub by_category: BTreeMap<String, CategoryMetrics>,
    pub mean_latency_ms: f64,
}

impl MetricAggregate {
    pub fn primary(&self, metric: PrimaryMetric) -> f64 {
        match metric {
            PrimaryMetric::Recall => self.recall_at_k,
            PrimaryMetric::Mrr => self.mrr,
            PrimaryMetric::Precision => self.precision_at_k,
            PrimaryMetric::F1 => self.f1,
            PrimaryMetric::ExactMatch => self.exact_match,
        }
    }

    pub fn as_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("recall_at_k".to_string(), self.recall_at_k),
            ("precision_at_k".to_string(), self.precision_at_k),
            ("mrr".to_string(), self.mrr),
            ("f1".to_string(), self.f1),
            ("exact_match".to_string(), self.exact_match),
        ])
    }
}

#[derive(Debug, Default)]
pub struct MetricAccumulator {
    top_k: usize,
    recall: f64,
    precision: f64,
    reciprocal_rank: f64,
    f1: f64,
    exact_match: f64,
    evaluated: usize,
    skipped: usize,
    exact_match_evaluated: usize,
    latency_ms: f64,
    queries: usize,
    rank_distribution: BTreeMap<usize, usize>,
    categories: BTreeMap<String, CategoryMetrics>,
}

impl MetricAccumulator {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }

    pub fn add(
        &mut self,
        metrics: &QueryMetrics,
        scorable: bool,
        category: Option<&str>,
        latency_ms: f64,
    ) {
        self.queries += 1;
        self.latency_ms += latency_ms;

        if let Some(value) = metrics.exact_match {
            self.exact_match += value;
            self.exact_match_evaluated += 1;
        }

        if !scorable {
            self.skipped += 1;
            return;
        }

        self.evaluated += 1;
        self.recall += metrics.recall;
        self.precision += metrics.precision;
        self.reciprocal_rank += metrics.reciprocal_rank;
        self.f1 += metrics.f1;
        if let Some(rank) = metrics.first_relevant_rank {
            *self.rank_distribution.entry(rank).or_default() += 1;
        }

        if let Some(category) = category {
            let entry = self.categories.entry(category.to_string()).or_default();
            entry.queries += 1;
            entry.recall_at_k += metrics.recall;
            entry.mrr += metrics.reciprocal_rank;
        }
    }

    pub fn finish(self) -> MetricAggregate {
        let mean = |sum: f64, count: usize| if count == 0 { 0.0 } else { sum / count as f64 };

        MetricAggregate {
            top_k: self.top_k,
            recall_at_k: mean(self.recall, self.evaluated),
            precision_at_k: mean(self.precision, self.evaluated),
            mrr: mean(self.reciprocal_rank, self.evaluated),
            f1: mean(self.f1, self.evaluated),
            exact_match: mean(self.exact_match, self.exact_match_evaluated),
            evaluated: self.evaluated,
            skipped: self.skipped,
            exact_match_evaluated: self.exact_match_evaluated,
            rank_distribution: self.rank_distribution,
            by_category: self
                .categories
                .into_iter()
                .map(|(name, sums)| {
                    let metrics = CategoryMetrics {
                        queries: sums.queries,
                        recall_at_k: mean(sums.recall_at_k, sums.queries),
                        mrr: mean(sums.mrr, sums.queries),
                    };
                    (name, metrics)
                })
                .collect(),
            mean_latency_ms: mean(self.latency_ms, self.queries),
        }
    }
}
