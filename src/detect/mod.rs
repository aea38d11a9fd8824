//! Anomaly detection: per-entity scoring, the lock table and result types.

pub mod engine;
pub mod hooks;
pub mod lock;
pub mod result;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::baseline::codec::CodecError;
use crate::storage::StoreError;

pub use self::engine::{AnomalyDetector, DetectConfig, StoreFailurePolicy, DEFAULT_THRESHOLD};
pub use self::hooks::{DetectionHook, TracingHook};
pub use self::lock::{LockTable, LockTimeout};
pub use self::result::{
    BaselineSnapshot, BaselineSource, ContributingFactor, DetectionResult, Observation, Severity,
};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("invalid detection config: {0}")]
    InvalidConfig(String),

    #[error("baseline store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("timed out after {waited_ms}ms waiting for the lock on entity '{entity}'")]
    EntityLockTimeout { entity: String, waited_ms: u64 },

    #[error("stored baseline for entity '{entity}' is unreadable: {source}")]
    CorruptBaseline {
        entity: String,
        #[source]
        source: CodecError,
    },

    #[error("scored entity '{}' but failed to persist its baseline: {source}", .result.entity)]
    PersistFailed {
        result: Box<DetectionResult>,
        #[source]
        source: StoreError,
    },
}

/// Stable, serializable classification of a [`DetectError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidObservation,
    InvalidConfig,
    StoreUnavailable,
    EntityLockTimeout,
    CorruptBaseline,
    PersistFailed,
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectError::InvalidObservation(_) => ErrorKind::InvalidObservation,
            DetectError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            DetectError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            DetectError::EntityLockTimeout { .. } => ErrorKind::EntityLockTimeout,
            DetectError::CorruptBaseline { .. } => ErrorKind::CorruptBaseline,
            DetectError::PersistFailed { .. } => ErrorKind::PersistFailed,
        }
    }

    /// Whether the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DetectError::StoreUnavailable(_)
                | DetectError::EntityLockTimeout { .. }
                | DetectError::PersistFailed { .. }
        )
    }
}

impl From<LockTimeout> for DetectError {
    fn from(t: LockTimeout) -> Self {
        DetectError::EntityLockTimeout {
            entity: t.entity,
            waited_ms: t.waited.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kinds_and_retry() {
        let invalid = DetectError::InvalidObservation("NaN".into());
        assert_eq!(invalid.kind(), ErrorKind::InvalidObservation);
        assert!(!invalid.is_retryable());

        let timeout: DetectError = LockTimeout {
            entity: "hot".into(),
            waited: Duration::from_millis(250),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::EntityLockTimeout);
        assert!(timeout.is_retryable());
        assert!(timeout.to_string().contains("250ms"));

        let store: DetectError = StoreError::Unavailable("down".into()).into();
        assert_eq!(store.kind(), ErrorKind::StoreUnavailable);
        assert!(store.is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::EntityLockTimeout).unwrap();
        assert_eq!(json, "\"entity_lock_timeout\"");
    }
}
