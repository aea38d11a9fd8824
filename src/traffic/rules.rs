//! Stateful traffic rules backed by the baseline store.
//!
//! Each rule is a read-modify-write of one small JSON record, serialized by
//! the same per-key lock table the detector uses.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ApiCall, Finding, FindingKind};
use crate::baseline::codec::CodecError;
use crate::config::TrafficConfig;
use crate::detect::{AnomalyDetector, DetectError};
use crate::storage::ttl_from_secs;

/// Load the record at `key`, apply `f`, and write the new record back.
async fn update_record<R, T, F>(
    detector: &AnomalyDetector,
    key: &str,
    lock_timeout: Duration,
    ttl: Option<Duration>,
    f: F,
) -> Result<T, DetectError>
where
    R: Serialize + DeserializeOwned,
    F: FnOnce(Option<R>) -> (R, T),
{
    detector
        .locks()
        .with_entity_lock(key, lock_timeout, || async {
            let store = detector.store();
            let current = detector
                .store_io(store.get(key))
                .await?
                .map(|bytes| serde_json::from_slice::<R>(&bytes))
                .transpose()
                .map_err(|e| corrupt(key, e))?;

            let (next, out) = f(current);
            let encoded = serde_json::to_vec(&next).map_err(|e| corrupt(key, e))?;
            detector
                .store_io(store.set(key, Bytes::from(encoded), ttl))
                .await?;
            Ok::<_, DetectError>(out)
        })
        .await?
}

fn corrupt(key: &str, e: serde_json::Error) -> DetectError {
    DetectError::CorruptBaseline {
        entity: key.to_string(),
        source: CodecError::Json(e),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RateWindow {
    request_ids: BTreeSet<String>,
}

/// Count distinct requests to the endpoint in the current fixed window.
pub async fn request_rate(
    detector: &AnomalyDetector,
    config: &TrafficConfig,
    call: &ApiCall,
    lock_timeout: Duration,
) -> Result<Option<Finding>, DetectError> {
    let window = config.rate_window_secs as i64;
    let ts = call.timestamp.timestamp();
    let bucket = Utc
        .timestamp_opt(ts - ts.rem_euclid(window), 0)
        .single()
        .unwrap_or(call.timestamp);
    let key = format!("rate:{}:{}", call.endpoint, bucket.format("%Y-%m-%dT%H:%M:%S"));
    let ttl = Some(Duration::from_secs(config.rate_window_secs));
    let request_id = call.request_id.clone();

    let count = update_record::<RateWindow, u64, _>(detector, &key, lock_timeout, ttl, |current| {
        let mut seen = current.unwrap_or_default();
        seen.request_ids.insert(request_id);
        let n = seen.request_ids.len() as u64;
        (seen, n)
    })
    .await?;

    if count > config.rate_threshold {
        return Ok(Some(Finding {
            kind: FindingKind::IncreasedRequestRate,
            reason: format!(
                "Request rate of {} in the last {}s exceeds threshold of {} for endpoint {}.",
                count, config.rate_window_secs, config.rate_threshold, call.endpoint
            ),
        }));
    }
    Ok(None)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecentRequests {
    /// `(timestamp_ms, request_id)`, oldest first.
    entries: Vec<(i64, String)>,
}

/// Flag a client hitting the same endpoint repeatedly inside a sliding window.
pub async fn repetitive_requests(
    detector: &AnomalyDetector,
    config: &TrafficConfig,
    call: &ApiCall,
    lock_timeout: Duration,
) -> Result<Option<Finding>, DetectError> {
    let window_ms = (config.repetitive_window_secs as i64).saturating_mul(1000);
    let now_ms = call.timestamp.timestamp_millis();
    let key = format!("repetitive:{}:{}", call.client_id, call.endpoint);
    let ttl = Some(Duration::from_secs(config.repetitive_window_secs + 5));
    let request_id = call.request_id.clone();

    let count = update_record::<RecentRequests, usize, _>(
        detector,
        &key,
        lock_timeout,
        ttl,
        |current| {
            let mut recent = current.unwrap_or_default();
            if !recent.entries.iter().any(|(_, id)| *id == request_id) {
                let at = recent.entries.partition_point(|(t, _)| *t <= now_ms);
                recent.entries.insert(at, (now_ms, request_id));
            }
            let cutoff = now_ms - window_ms;
            recent.entries.retain(|(t, _)| *t > cutoff);
            let n = recent.entries.len();
            (recent, n)
        },
    )
    .await?;

    if count > config.repetitive_threshold {
        return Ok(Some(Finding {
            kind: FindingKind::RepetitiveRequest,
            reason: format!(
                "Client {} made {} requests to {} in the last {} seconds.",
                call.client_id, count, call.endpoint, config.repetitive_window_secs
            ),
        }));
    }
    Ok(None)
}

/// Flag response schemas the endpoint has not produced before.
///
/// The first schema seen for an endpoint is learned without a finding.
pub async fn schema_novelty(
    detector: &AnomalyDetector,
    config: &TrafficConfig,
    call: &ApiCall,
    lock_timeout: Duration,
) -> Result<Option<Finding>, DetectError> {
    let key = format!("schema_hashes:{}", call.endpoint);
    let ttl = ttl_from_secs(config.schema_ttl_seconds);
    let hash = call.schema_hash.clone();

    let novel = update_record::<BTreeSet<String>, bool, _>(
        detector,
        &key,
        lock_timeout,
        ttl,
        |current| {
            let mut known = current.unwrap_or_default();
            let novel = !known.is_empty() && !known.contains(&hash);
            known.insert(hash);
            (known, novel)
        },
    )
    .await?;

    if novel {
        return Ok(Some(Finding {
            kind: FindingKind::NewResponseSchema,
            reason: format!(
                "Endpoint {} returned unseen response schema {}.",
                call.endpoint, call.schema_hash
            ),
        }));
    }
    Ok(None)
}
