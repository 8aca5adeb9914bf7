use crate::error::{Result, Stage};
use crate::models::Configuration;
use crate::optimizer::{ConfigState, SweepReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Evaluated,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEntry {
    pub id: String,
    pub configuration: Configuration,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_10k_docs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Evaluated but outside the hard constraints.
    #[serde(default)]
    pub constraint_violation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLog {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub entries: Vec<RunEntry>,
    pub frontier: Vec<String>,
    pub recommended: Option<String>,
}

impl RunLog {
    pub fn from_report(report: &SweepReport, started_at: DateTime<Utc>) -> Self {
        let entries = report
            .outcomes
            .iter()
            .map(|outcome| {
                let mut entry = RunEntry {
                    id: outcome.configuration.fingerprint(),
                    configuration: outcome.configuration.clone(),
                    status: RunStatus::Cancelled,
                    metrics: BTreeMap::new(),
                    cost_per_10k_docs: None,
                    latency_ms: None,
                    stage: None,
                    reason: None,
                    constraint_violation: false,
                };
                match (&outcome.state, &outcome.result) {
                    (ConfigState::Evaluated, Some(result)) => {
                        entry.status = RunStatus::Evaluated;
                        entry.metrics = result.metrics.as_map();
                        entry.cost_per_10k_docs = Some(result.cost_per_10k_docs);
                        entry.latency_ms = Some(result.latency_ms);
                        entry.constraint_violation = !outcome.within_constraints;
                    }
                    (ConfigState::Failed { stage, reason }, _) => {
                        entry.status = RunStatus::Failed;
                        entry.stage = Some(*stage);
                        entry.reason = Some(reason.clone());
                    }
                    _ => {}
                }
                entry
            })
            .collect();

        Self {
            started_at,
            finished_at: Utc::now(),
            cancelled: report.cancelled,
            entries,
            frontier: report
                .frontier
                .iter()
                .map(|result| result.configuration.fingerprint())
                .collect(),
            recommended: report
                .recommended
                .as_ref()
                .map(|result| result.configuration.fingerprint()),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}
