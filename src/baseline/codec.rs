//! Byte encoding for baselines held in the store.
//!
//! Records are a versioned JSON envelope. `serde_json` is built with
//! `float_roundtrip`, so decoding an encoded model yields an identical model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BaselineModel;

pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed baseline record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported baseline record version {0}")]
    UnsupportedVersion(u8),
    #[error("baseline record violates model invariants")]
    Invalid,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u8,
    baseline: &'a BaselineModel,
}

#[derive(Deserialize)]
struct Envelope {
    version: u8,
    baseline: BaselineModel,
}

pub fn encode(model: &BaselineModel) -> Result<Vec<u8>, CodecError> {
    // Non-finite floats serialize as `null` and would not decode.
    if !model.is_valid() {
        return Err(CodecError::Invalid);
    }
    let envelope = EnvelopeRef {
        version: FORMAT_VERSION,
        baseline: model,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<BaselineModel, CodecError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.version));
    }
    if !envelope.baseline.is_valid() {
        return Err(CodecError::Invalid);
    }
    Ok(envelope.baseline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    #[test]
    fn test_encoded_shape() {
        let model = BaselineModel {
            count: 2,
            mean: 1.5,
            m2: 0.5,
            last_updated: None,
        };
        let bytes = encode(&model).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["baseline"]["count"], 2);
    }

    #[test]
    fn test_rejects_bad_records() {
        assert!(matches!(decode(b"not json"), Err(CodecError::Json(_))));

        let future = br#"{"version":9,"baseline":{"count":0,"mean":0.0,"m2":0.0}}"#;
        assert!(matches!(
            decode(future),
            Err(CodecError::UnsupportedVersion(9))
        ));

        let negative = br#"{"version":1,"baseline":{"count":4,"mean":1.0,"m2":-2.0}}"#;
        assert!(matches!(decode(negative), Err(CodecError::Invalid)));
    }

    #[test]
    fn test_refuses_to_encode_invalid_model() {
        let overflowed = BaselineModel {
            count: 2,
            mean: 5e199,
            m2: f64::INFINITY,
            last_updated: None,
        };
        assert!(matches!(encode(&overflowed), Err(CodecError::Invalid)));
    }

    #[test]
    fn test_missing_timestamp_defaults() {
        let bytes = br#"{"version":1,"baseline":{"count":3,"mean":2.0,"m2":1.0}}"#;
        let m = decode(bytes).unwrap();
        assert_eq!(m.count, 3);
        assert!(m.last_updated.is_none());
    }

    proptest! {
        #[test]
        fn prop_roundtrip_is_exact(
            count in 1u64..u64::MAX,
            mean in -1e300f64..1e300f64,
            m2 in 0f64..1e300f64,
            secs in 0i64..4_102_444_800i64,
            nanos in 0u32..1_000_000_000u32,
        ) {
            let model = BaselineModel {
                count,
                mean,
                m2,
                last_updated: Some(Utc.timestamp_opt(secs, nanos).unwrap()),
            };
            let decoded = decode(&encode(&model).unwrap()).unwrap();
            prop_assert_eq!(decoded, model);
        }
    }
}
