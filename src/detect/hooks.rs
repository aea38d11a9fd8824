//! Observer hooks. The detector itself does not log; callers attach hooks.

use super::{DetectError, DetectionResult, ErrorKind};

pub trait DetectionHook: Send + Sync {
    fn on_detection(&self, _result: &DetectionResult) {}

    fn on_error(&self, _entity: &str, _error: &DetectError) {}
}

/// Logs anomalies and failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl DetectionHook for TracingHook {
    fn on_detection(&self, result: &DetectionResult) {
        if result.anomalous {
            tracing::warn!(
                entity = %result.entity,
                value = result.value,
                score = result.score,
                threshold = result.threshold,
                severity = ?result.severity,
                baseline_mean = result.baseline.mean,
                baseline_std_dev = result.baseline.std_dev,
                "anomaly detected"
            );
        } else {
            tracing::debug!(entity = %result.entity, score = result.score, "observation scored");
        }
        if !result.persisted {
            tracing::warn!(entity = %result.entity, source = ?result.baseline_source, "baseline not persisted");
        }
    }

    fn on_error(&self, entity: &str, error: &DetectError) {
        match error.kind() {
            ErrorKind::InvalidObservation | ErrorKind::InvalidConfig => {
                tracing::debug!(%entity, error = %error, "detection rejected");
            }
            ErrorKind::CorruptBaseline | ErrorKind::PersistFailed => {
                tracing::error!(%entity, kind = ?error.kind(), error = %error, "detection failed");
            }
            ErrorKind::StoreUnavailable | ErrorKind::EntityLockTimeout => {
                tracing::warn!(%entity, kind = ?error.kind(), error = %error, "detection failed");
            }
        }
    }
}
