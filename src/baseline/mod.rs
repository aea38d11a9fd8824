//! Per-entity statistical baselines.
//!
//! A [`BaselineModel`] is a Welford accumulator: running count, mean and the
//! sum of squared deviations (`m2`). Scoring and updating are O(1) and no
//! observation history is kept.

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard deviations below this are clamped to it when scoring.
pub const STD_DEV_FLOOR: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("observation value is not finite: {0}")]
    NonFinite(f64),
    #[error("observation {0} would overflow the baseline accumulator")]
    Overflow(f64),
}

/// How the accumulator treats long histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Every observation counts equally, forever.
    #[default]
    Unbounded,
    /// Once `max_samples` is reached the accumulator is rescaled to
    /// `max_samples - 1` samples before each update, so older observations
    /// fade geometrically and `count` never exceeds `max_samples`.
    Decay { max_samples: u64 },
}

/// Statistical summary of one entity's normal behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl BaselineModel {
    /// A model with no observations.
    pub fn cold() -> Self {
        Self::default()
    }

    pub fn is_cold(&self) -> bool {
        self.count == 0
    }

    /// Population variance, `m2 / n`. Zero until two samples exist.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Absolute standardized deviation of `value` from this baseline.
    ///
    /// Returns `0.0` while the baseline holds one sample or fewer.
    pub fn score(&self, value: f64) -> Result<f64, ModelError> {
        ensure_finite(value)?;
        if self.count <= 1 {
            return Ok(0.0);
        }
        let deviation = (value - self.mean).abs();
        if deviation == 0.0 {
            return Ok(0.0);
        }
        let score = deviation / self.std_dev().max(STD_DEV_FLOOR);
        Ok(if score.is_finite() { score } else { f64::MAX })
    }

    /// Fold `value` into the accumulator.
    pub fn update(
        &mut self,
        value: f64,
        at: DateTime<Utc>,
        window: WindowPolicy,
    ) -> Result<(), ModelError> {
        ensure_finite(value)?;

        let mut next = self.clone();
        if let WindowPolicy::Decay { max_samples } = window {
            let cap = max_samples.max(2);
            if next.count >= cap {
                let keep = (cap - 1) as f64;
                next.m2 *= keep / next.count as f64;
                next.count = cap - 1;
            }
        }

        let n = next.count + 1;
        let delta = value - next.mean;
        let mean = next.mean + delta / n as f64;
        next.m2 += delta * (value - mean);
        next.mean = mean;
        next.count = n;
        // Rounding can push m2 a hair below zero when values are identical.
        if next.m2 < 0.0 {
            next.m2 = 0.0;
        }
        next.last_updated = Some(at);

        // Finite inputs can still overflow mean or m2; leave self untouched.
        if !next.is_valid() {
            return Err(ModelError::Overflow(value));
        }
        *self = next;
        Ok(())
    }

    /// Score `value` against the current baseline, then return the updated
    /// model. The observation is never scored against itself.
    pub fn score_and_update(
        &self,
        value: f64,
        at: DateTime<Utc>,
        window: WindowPolicy,
    ) -> Result<(f64, BaselineModel), ModelError> {
        let score = self.score(value)?;
        let mut updated = self.clone();
        updated.update(value, at, window)?;
        Ok((score, updated))
    }

    /// Combine two independent accumulators (Chan et al. parallel update).
    pub fn merge(&self, other: &BaselineModel) -> BaselineModel {
        if other.is_cold() {
            return self.clone();
        }
        if self.is_cold() {
            return other.clone();
        }

        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let (na, nb, n) = (self.count as f64, other.count as f64, count as f64);
        let mean = self.mean + delta * nb / n;
        let m2 = self.m2 + other.m2 + delta * delta * na * nb / n;

        BaselineModel {
            count,
            mean,
            m2,
            last_updated: self.last_updated.max(other.last_updated),
        }
    }

    /// True when the model satisfies its invariants.
    pub fn is_valid(&self) -> bool {
        if !self.mean.is_finite() || !self.m2.is_finite() || self.m2 < 0.0 {
            return false;
        }
        self.count > 0 || (self.mean == 0.0 && self.m2 == 0.0)
    }
}

fn ensure_finite(value: f64) -> Result<(), ModelError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ModelError::NonFinite(value))
    }
}
