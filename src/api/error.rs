use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::detect::{DetectError, ErrorKind};

/// A [`DetectError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DetectError);

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::InvalidObservation | ErrorKind::InvalidConfig => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::EntityLockTimeout => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::CorruptBaseline | ErrorKind::PersistFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
                "retryable": self.0.is_retryable(),
            }
        });
        // The score was computed; hand it back so the caller can decide.
        if let DetectError::PersistFailed { result, .. } = &self.0 {
            body["data"] = serde_json::to_value(result.as_ref()).unwrap_or_default();
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DetectError::InvalidObservation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                DetectError::EntityLockTimeout {
                    entity: "e".into(),
                    waited_ms: 5,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                DetectError::StoreUnavailable(StoreError::Unavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
