use crate::chunking::StrategyKind;
use crate::embeddings::{BackendSpec, ModelSpec};
use crate::error::{Result, SweepError};
use crate::metrics::PrimaryMetric;
use crate::models::{ChunkParams, Configuration};
use crate::pareto::Constraints;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Grid of candidate values. Strategy and model names keep their order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchSpace {
    pub strategies: Vec<String>,
    #[serde(default)]
    pub chunk_sizes: Vec<usize>,
    #[serde(default)]
    pub overlaps: Vec<usize>,
    #[serde(default)]
    pub sentence_max_tokens: Vec<usize>,
    pub models: Vec<String>,
}

impl SearchSpace {
    /// Deduplicated cartesian product in deterministic order: strategies,
    /// then sizes, overlaps and sentence limits, then models.
    ///
    /// Sliding windows whose overlap reaches the chunk size are skipped.
    /// An unrecognized strategy name still yields one configuration per
    /// model so it fails on its own at the chunking stage.
    pub fn enumerate(&self) -> Result<Vec<Configuration>> {
        let mut seen = HashSet::new();
        let mut grid = Vec::new();

        for strategy in &self.strategies {
            for params in self.params_for(strategy) {
                for model in &self.models {
                    let configuration = Configuration::new(strategy.as_str(), params, model.as_str());
                    if seen.insert(configuration.clone()) {
                        grid.push(configuration);
                    }
                }
            }
        }

        if grid.is_empty() {
            return Err(SweepError::Configuration(
                "search space yields no valid configuration".to_string(),
            ));
        }
        Ok(grid)
    }

    fn params_for(&self, strategy: &str) -> Vec<ChunkParams> {
        let Ok(kind) = StrategyKind::from_name(strategy) else {
            let chunk_size = self.chunk_sizes.first().copied().unwrap_or_default();
            return vec![ChunkParams::fixed(chunk_size)];
        };

        match kind {
            StrategyKind::FixedToken => self
                .chunk_sizes
                .iter()
                .map(|size| ChunkParams::fixed(*size))
                .collect(),
            StrategyKind::SlidingWindow => {
                let overlaps = if self.overlaps.is_empty() {
                    vec![0]
                } else {
                    self.overlaps.clone()
                };
                let mut params = Vec::new();
                for size in &self.chunk_sizes {
                    for overlap in &overlaps {
                        if overlap >= size {
                            warn!(chunk_size = size, overlap, "skipping sliding window with overlap >= chunk_size");
                            continue;
                        }
                        params.push(ChunkParams::sliding(*size, *overlap));
                    }
                }
                params
            }
            StrategyKind::SentenceAware => self
                .sentence_max_tokens
                .iter()
                .map(|max_tokens| ChunkParams::sentences(*max_tokens))
                .collect(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    pub space: SearchSpace,
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default = "default_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default)]
    pub primary_metric: PrimaryMetric,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub keep_collections: bool,
}

impl SweepConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| SweepError::Configuration(format!("invalid sweep config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let space = &self.space;
        if space.strategies.is_empty() {
            return Err(invalid("at least one strategy is required"));
        }
        if space.models.is_empty() {
            return Err(invalid("at least one embedding model is required"));
        }
        if space.chunk_sizes.contains(&0) {
            return Err(invalid("chunk sizes must be at least 1"));
        }
        if space.sentence_max_tokens.contains(&0) {
            return Err(invalid("sentence max tokens must be at least 1"));
        }

        for strategy in &space.strategies {
            match StrategyKind::from_name(strategy) {
                Ok(StrategyKind::FixedToken | StrategyKind::SlidingWindow)
                    if space.chunk_sizes.is_empty() =>
                {
                    return Err(invalid(&format!("{strategy} needs at least one chunk size")));
                }
                Ok(StrategyKind::SentenceAware) if space.sentence_max_tokens.is_empty() => {
                    return Err(invalid(&format!(
                        "{strategy} needs at least one sentence max tokens value"
                    )));
                }
                _ => {}
            }
        }

        if self.retrieval_top_k == 0 {
            return Err(invalid("retrieval_top_k must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        for (name, limit) in [
            ("max_latency_ms", self.constraints.max_latency_ms),
            ("max_cost_per_10k_docs", self.constraints.max_cost_per_10k_docs),
        ] {
            if let Some(limit) = limit {
                if !limit.is_finite() || limit < 0.0 {
                    return Err(invalid(&format!("{name} must be a non-negative number")));
                }
            }
        }

        let mut catalogue = HashSet::new();
        for spec in &self.models {
            if !catalogue.insert(spec.name.as_str()) {
                return Err(invalid(&format!("model {} is declared twice", spec.name)));
            }
            match &spec.backend {
                BackendSpec::Remote(settings) => settings.validate(&spec.name)?,
                BackendSpec::Local { dimensions } if *dimensions == 0 => {
                    return Err(invalid(&format!("model {}: dimensions must be at least 1", spec.name)));
                }
                BackendSpec::Local { .. } => {}
            }
        }
        if let Some(unknown) = space.models.iter().find(|name| !catalogue.contains(name.as_str())) {
            return Err(invalid(&format!("model {unknown} is not declared in models")));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> SweepError {
    SweepError::Configuration(message.to_string())
}
