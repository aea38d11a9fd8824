//! API traffic analysis: one call in, a combined anomaly report out.
//!
//! Combines the response-time baseline of the endpoint with three stateful
//! rules: request-rate spikes, repetitive client requests and unseen response
//! schemas.

pub mod rules;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrafficConfig;
use crate::detect::{AnomalyDetector, DetectConfig, DetectError, DetectionResult, Observation};

/// Telemetry for a single served API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub request_id: String,
    #[serde(alias = "timestamp_utc")]
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    #[serde(default)]
    pub http_method: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    #[serde(alias = "client_ip")]
    pub client_id: String,
    #[serde(default)]
    pub schema_hash: String,
}

impl ApiCall {
    pub fn validate(&self) -> Result<(), DetectError> {
        let missing = [
            ("request_id", &self.request_id),
            ("endpoint", &self.endpoint),
            ("client_id", &self.client_id),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty());
        if let Some((field, _)) = missing {
            return Err(DetectError::InvalidObservation(format!("{field} must not be empty")));
        }
        if !self.response_time_ms.is_finite() || self.response_time_ms < 0.0 {
            return Err(DetectError::InvalidObservation(format!(
                "response_time_ms must be a finite non-negative number, got {}",
                self.response_time_ms
            )));
        }
        Ok(())
    }

    pub fn latency_entity(&self) -> String {
        format!("latency:{}", self.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    LatencySpike,
    NewResponseSchema,
    IncreasedRequestRate,
    RepetitiveRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: FindingKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub request_id: String,
    pub is_anomaly: bool,
    /// The response-time z-score against the endpoint baseline.
    pub anomaly_score: f64,
    pub findings: Vec<Finding>,
    pub latency: DetectionResult,
}

pub struct TrafficAnalyzer {
    detector: Arc<AnomalyDetector>,
    config: TrafficConfig,
}

impl TrafficAnalyzer {
    pub fn new(detector: Arc<AnomalyDetector>, config: TrafficConfig) -> Self {
        Self { detector, config }
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    /// Run every rule for `call`.
    ///
    /// The latency baseline is updated first; if it fails nothing has been
    /// recorded. The stateful rules then run concurrently on distinct keys
    /// and are idempotent per `request_id`, so retrying a failed call does
    /// not count it twice.
    pub async fn analyze(
        &self,
        call: &ApiCall,
        detect: &DetectConfig,
    ) -> Result<AnomalyReport, DetectError> {
        call.validate()?;
        self.config.validate()?;

        let entity = call.latency_entity();
        let observation = Observation::at(call.response_time_ms, call.timestamp);
        let lock_timeout = detect.lock_timeout();
        let detector = self.detector.as_ref();

        let latency = detector.detect(&entity, &observation, detect).await?;

        let schema = async {
            if call.schema_hash.is_empty() {
                return Ok(None);
            }
            rules::schema_novelty(detector, &self.config, call, lock_timeout).await
        };

        let (schema, rate, repetitive) = futures::try_join!(
            schema,
            rules::request_rate(detector, &self.config, call, lock_timeout),
            rules::repetitive_requests(detector, &self.config, call, lock_timeout),
        )?;

        let mut findings = Vec::new();
        if latency.anomalous {
            findings.push(Finding {
                kind: FindingKind::LatencySpike,
                reason: format!(
                    "Response time {:.1}ms (status {}) is {:.2} standard deviations from the \
                     endpoint baseline of {:.1}ms.",
                    call.response_time_ms, call.status_code, latency.score, latency.baseline.mean
                ),
            });
        }
        findings.extend([schema, rate, repetitive].into_iter().flatten());

        Ok(AnomalyReport {
            request_id: call.request_id.clone(),
            is_anomaly: !findings.is_empty(),
            anomaly_score: latency.score,
            findings,
            latency,
        })
    }
}
