//! Run summary aggregation.
//!
//! Folds the run's durable sample log into per-metric statistics and a
//! single summary artifact naming the outcome — and, for a failed run,
//! the failing stage and payload index.

use crate::{
    loadgen::LoadSummary,
    telemetry::MetricSample,
};
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    io::BufRead,
    path::{
        Path,
        PathBuf,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed sample at {path}:{line}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Distribution of one metric across the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p95: f64,
}

impl MetricStats {
    fn from_values(mut values: Vec<f64>) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        let count = values.len() as u64;
        let sum: f64 = values.iter().sum();
        let p95_index = ((count as f64 * 0.95).ceil() as usize).saturating_sub(1);
        Self {
            count,
            min: values[0],
            max: values[values.len() - 1],
            mean: sum / count as f64,
            p95: values[p95_index],
        }
    }
}

/// Failure half of a summary, present only for failed runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accepted_payload: Option<String>,
}

/// The one artifact every run leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub scenario: String,
    pub client: String,
    pub succeeded: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub payloads_processed: u64,
    pub total_gas_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gigagas_per_second: Option<f64>,
    pub samples_dropped: u64,
    pub metrics: BTreeMap<String, MetricStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

fn read_samples(path: &Path) -> Result<Vec<MetricSample>, SummaryError> {
    let io_err = |source| {
        SummaryError::Io {
            path: path.to_path_buf(),
            source,
        }
    };
    let file = std::fs::File::open(path).map_err(io_err)?;
    let mut samples = Vec::new();
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        samples.push(serde_json::from_str(&line).map_err(|source| {
            SummaryError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            }
        })?);
    }
    Ok(samples)
}

/// Per-metric statistics over the durable sample log.
pub fn summarize_samples(path: &Path) -> Result<BTreeMap<String, MetricStats>, SummaryError> {
    let mut by_name: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for sample in read_samples(path)? {
        by_name.entry(sample.name).or_default().push(sample.value);
    }
    Ok(by_name
        .into_iter()
        .map(|(name, values)| (name, MetricStats::from_values(values)))
        .collect())
}

/// Last `n` samples of the log, for failure diagnostics.
pub fn tail_samples(path: &Path, n: usize) -> Result<Vec<MetricSample>, SummaryError> {
    let mut samples = read_samples(path)?;
    let keep = samples.len().saturating_sub(n);
    Ok(samples.split_off(keep))
}

/// Writes the summary as pretty JSON.
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), SummaryError> {
    let json = serde_json::to_vec_pretty(summary).map_err(|source| {
        SummaryError::Malformed {
            path: path.to_path_buf(),
            line: 0,
            source,
        }
    })?;
    std::fs::write(path, json).map_err(|source| {
        SummaryError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}
