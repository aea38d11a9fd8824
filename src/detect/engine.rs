//! The anomaly detector: lock, load, score, update, persist, classify.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::hooks::DetectionHook;
use super::lock::LockTable;
use super::result::{
    BaselineSnapshot, BaselineSource, ContributingFactor, DetectionResult, Observation, Severity,
};
use super::DetectError;
use crate::baseline::{codec, BaselineModel, ModelError, WindowPolicy};
use crate::storage::{baseline_key, ttl_from_secs, BaselineStore, StoreError};

/// 3-sigma rule.
pub const DEFAULT_THRESHOLD: f64 = 3.0;
pub const DEFAULT_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;

/// What to do when the baseline store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Fail the request.
    #[default]
    Fail,
    /// Score against a process-local model and report `persisted: false`.
    Ephemeral,
}

/// Per-call detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub threshold: f64,
    /// Expiry applied to the persisted baseline; 0 keeps it indefinitely.
    pub ttl_seconds: u64,
    pub lock_timeout_ms: u64,
    pub on_store_failure: StoreFailurePolicy,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            on_store_failure: StoreFailurePolicy::Fail,
        }
    }
}

impl DetectConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(DetectError::InvalidConfig(format!(
                "threshold must be a finite non-negative number, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

enum Loaded {
    Reachable(Option<BaselineModel>),
    Unreachable,
}

pub struct AnomalyDetector {
    store: Arc<dyn BaselineStore>,
    locks: LockTable,
    /// Observations not yet persisted, per entity. Only touched under the
    /// entity's lock.
    ephemeral: DashMap<String, BaselineModel>,
    hooks: Vec<Arc<dyn DetectionHook>>,
    store_timeout: Duration,
    window: WindowPolicy,
}

impl AnomalyDetector {
    pub fn new(store: Arc<dyn BaselineStore>) -> Self {
        Self {
            store,
            locks: LockTable::new(),
            ephemeral: DashMap::new(),
            hooks: Vec::new(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            window: WindowPolicy::Unbounded,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_window(mut self, window: WindowPolicy) -> Self {
        self.window = window;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn DetectionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn store(&self) -> &Arc<dyn BaselineStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Entities holding observations that have not reached the store.
    pub fn ephemeral_len(&self) -> usize {
        self.ephemeral.len()
    }

    /// Score `observation` against `entity`'s baseline and fold it in.
    pub async fn detect(
        &self,
        entity: &str,
        observation: &Observation,
        config: &DetectConfig,
    ) -> Result<DetectionResult, DetectError> {
        let outcome = self.detect_inner(entity, observation, config).await;
        match &outcome {
            Ok(result) => self.hooks.iter().for_each(|h| h.on_detection(result)),
            Err(e) => self.hooks.iter().for_each(|h| h.on_error(entity, e)),
        }
        outcome
    }

    /// Read `entity`'s persisted baseline.
    pub async fn baseline(
        &self,
        entity: &str,
        lock_timeout: Duration,
    ) -> Result<Option<BaselineModel>, DetectError> {
        validate_entity(entity)?;
        self.locks
            .with_entity_lock(entity, lock_timeout, || async {
                let key = baseline_key(entity);
                let bytes = self.store_io(self.store.get(&key)).await?;
                bytes.map(|b| decode(entity, &b)).transpose()
            })
            .await?
    }

    /// Forget `entity`'s baseline, persisted and ephemeral.
    pub async fn reset(&self, entity: &str, lock_timeout: Duration) -> Result<bool, DetectError> {
        validate_entity(entity)?;
        self.locks
            .with_entity_lock(entity, lock_timeout, || async {
                let key = baseline_key(entity);
                let deleted = self.store_io(self.store.delete(&key)).await?;
                let dropped = self.ephemeral.remove(entity).is_some();
                Ok::<_, DetectError>(deleted || dropped)
            })
            .await?
    }

    /// Bound a store call by the configured I/O timeout.
    ///
    /// Backends that bound their own calls are awaited to completion, so a
    /// reported failure is never followed by a late write.
    pub async fn store_io<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.store.bounds_own_io() {
            return fut.await;
        }
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    async fn detect_inner(
        &self,
        entity: &str,
        observation: &Observation,
        config: &DetectConfig,
    ) -> Result<DetectionResult, DetectError> {
        validate_entity(entity)?;
        observation.validate()?;
        config.validate()?;

        let at = observation.timestamp.unwrap_or_else(Utc::now);
        self.locks
            .with_entity_lock(entity, config.lock_timeout(), || {
                self.score_locked(entity, observation.value, at, config)
            })
            .await?
    }

    async fn score_locked(
        &self,
        entity: &str,
        value: f64,
        at: DateTime<Utc>,
        config: &DetectConfig,
    ) -> Result<DetectionResult, DetectError> {
        let key = baseline_key(entity);

        let loaded = match self.store_io(self.store.get(&key)).await {
            Ok(bytes) => Loaded::Reachable(bytes.map(|b| decode(entity, &b)).transpose()?),
            Err(_) if config.on_store_failure == StoreFailurePolicy::Ephemeral => Loaded::Unreachable,
            Err(e) => return Err(e.into()),
        };

        let pending = self.ephemeral.get(entity).map(|m| m.value().clone());
        let mut pending_after = pending.clone().unwrap_or_default();
        pending_after
            .update(value, at, self.window)
            .map_err(invalid_observation)?;

        let (prior, source) = match &loaded {
            Loaded::Reachable(stored) => {
                let source = match (stored, &pending) {
                    (Some(_), _) => BaselineSource::Stored,
                    (None, Some(_)) => BaselineSource::Ephemeral,
                    (None, None) => BaselineSource::ColdStart,
                };
                let base = stored.clone().unwrap_or_default();
                let prior = match &pending {
                    Some(p) => base.merge(p),
                    None => base,
                };
                (prior, source)
            }
            Loaded::Unreachable => (pending.unwrap_or_default(), BaselineSource::Ephemeral),
        };

        let (score, updated) = prior
            .score_and_update(value, at, self.window)
            .map_err(invalid_observation)?;
        let mut result = build_result(entity, value, score, config.threshold, at, &prior, source);

        if let Loaded::Unreachable = loaded {
            self.ephemeral.insert(entity.to_string(), pending_after);
            return Ok(result);
        }

        let bytes = codec::encode(&updated).map_err(|source| DetectError::CorruptBaseline {
            entity: entity.to_string(),
            source,
        })?;
        let ttl = ttl_from_secs(config.ttl_seconds);

        match self.store_io(self.store.set(&key, Bytes::from(bytes), ttl)).await {
            Ok(()) => {
                self.ephemeral.remove(entity);
                result.persisted = true;
                Ok(result)
            }
            Err(e) => match config.on_store_failure {
                StoreFailurePolicy::Fail => Err(DetectError::PersistFailed {
                    result: Box::new(result),
                    source: e,
                }),
                StoreFailurePolicy::Ephemeral => {
                    self.ephemeral.insert(entity.to_string(), pending_after);
                    Ok(result)
                }
            },
        }
    }
}

fn validate_entity(entity: &str) -> Result<(), DetectError> {
    if entity.trim().is_empty() {
        return Err(DetectError::InvalidObservation(
            "entity key must not be empty".into(),
        ));
    }
    Ok(())
}

fn decode(entity: &str, bytes: &[u8]) -> Result<BaselineModel, DetectError> {
    codec::decode(bytes).map_err(|source| DetectError::CorruptBaseline {
        entity: entity.to_string(),
        source,
    })
}

fn invalid_observation(e: ModelError) -> DetectError {
    DetectError::InvalidObservation(e.to_string())
}

fn build_result(
    entity: &str,
    value: f64,
    score: f64,
    threshold: f64,
    at: DateTime<Utc>,
    prior: &BaselineModel,
    source: BaselineSource,
) -> DetectionResult {
    let anomalous = score > threshold;
    DetectionResult {
        entity: entity.to_string(),
        value,
        score,
        anomalous,
        threshold,
        severity: anomalous.then(|| Severity::from_score(score, threshold)),
        timestamp: at,
        baseline: BaselineSnapshot::from(prior),
        factors: vec![ContributingFactor {
            name: "value".to_string(),
            observed: value,
            expected: prior.mean,
            deviation: score,
        }],
        baseline_source: source,
        persisted: false,
    }
}
