//! Multi-objective selection over evaluated configurations.
//!
//! Objectives: maximize the primary quality metric, minimize cost per
//! 10k documents, minimize latency.

use crate::metrics::PrimaryMetric;
use crate::models::EvaluationResult;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
    #[serde(default)]
    pub max_cost_per_10k_docs: Option<f64>,
}

impl Constraints {
    pub fn satisfied_by(&self, result: &EvaluationResult) -> bool {
        self.max_latency_ms
            .map_or(true, |limit| result.latency_ms <= limit)
            && self
                .max_cost_per_10k_docs
                .map_or(true, |limit| result.cost_per_10k_docs <= limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Objectives {
    quality: f64,
    cost: f64,
    latency: f64,
}

impl Objectives {
    fn of(result: &EvaluationResult, primary: PrimaryMetric) -> Self {
        Self {
            quality: result.metrics.primary(primary),
            cost: result.cost_per_10k_docs,
            latency: result.latency_ms,
        }
    }
}

/// `a` dominates `b` when it is at least as good on every objective and
/// strictly better on one.
pub fn dominates(a: &EvaluationResult, b: &EvaluationResult, primary: PrimaryMetric) -> bool {
    let (a, b) = (Objectives::of(a, primary), Objectives::of(b, primary));
    let no_worse = a.quality >= b.quality && a.cost <= b.cost && a.latency <= b.latency;
    let better = a.quality > b.quality || a.cost < b.cost || a.latency < b.latency;
    no_worse && better
}

pub fn pareto_frontier<'a>(
    results: &[&'a EvaluationResult],
    primary: PrimaryMetric,
) -> Vec<&'a EvaluationResult> {
    results
        .iter()
        .filter(|candidate| {
            !results
                .iter()
                .any(|other| dominates(other, candidate, primary))
        })
        .copied()
        .collect()
}

fn preference(a: &EvaluationResult, b: &EvaluationResult, primary: PrimaryMetric) -> Ordering {
    let (a, b) = (Objectives::of(a, primary), Objectives::of(b, primary));
    b.quality
        .total_cmp(&a.quality)
        .then_with(|| a.cost.total_cmp(&b.cost))
        .then_with(|| a.latency.total_cmp(&b.latency))
}

/// Highest quality, then lowest cost, then lowest latency. Remaining ties
/// go to the earliest entry.
pub fn recommend<'a>(
    frontier: &[&'a EvaluationResult],
    primary: PrimaryMetric,
) -> Option<&'a EvaluationResult> {
    frontier
        .iter()
        .copied()
        .reduce(|best, next| {
            if preference(next, best, primary) == Ordering::Less {
                next
            } else {
                best
            }
        })
}
