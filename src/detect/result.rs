//! Observations in, detection results out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DetectError;
use crate::baseline::BaselineModel;

/// One reading for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Observation {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    pub fn at(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        if !self.value.is_finite() {
            return Err(DetectError::InvalidObservation(format!(
                "value must be finite, got {}",
                self.value
            )));
        }
        Ok(())
    }
}

/// Severity levels for anomalous results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Grade by how far past the threshold the score lies: beyond 2x is
    /// critical, beyond 1.5x a warning.
    pub fn from_score(score: f64, threshold: f64) -> Self {
        let ratio = if threshold > 0.0 {
            score / threshold
        } else {
            f64::INFINITY
        };
        if ratio > 2.0 {
            Severity::Critical
        } else if ratio > 1.5 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

/// Where the baseline used for scoring came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    Stored,
    ColdStart,
    /// Process-local model used while the store was unreachable.
    Ephemeral,
}

/// The baseline as it stood before the observation was applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub count: u64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&BaselineModel> for BaselineSnapshot {
    fn from(m: &BaselineModel) -> Self {
        Self {
            count: m.count,
            mean: m.mean,
            std_dev: m.std_dev(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub name: String,
    pub observed: f64,
    pub expected: f64,
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub entity: String,
    pub value: f64,
    pub score: f64,
    pub anomalous: bool,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub timestamp: DateTime<Utc>,
    pub baseline: BaselineSnapshot,
    pub factors: Vec<ContributingFactor>,
    pub baseline_source: BaselineSource,
    pub persisted: bool,
}
