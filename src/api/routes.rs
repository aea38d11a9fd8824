//! API route definitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::detect::{DetectConfig, Observation};
use crate::traffic::ApiCall;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/detect", post(detect))
        .route("/predict", post(predict))
        .route(
            "/baselines/{entity}",
            get(get_baseline).delete(delete_baseline),
        )
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "request_id": uuid::Uuid::new_v4(),
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "entity_locks": state.detector.locks().len(),
            "ephemeral_baselines": state.detector.ephemeral_len(),
        },
        "meta": meta(),
    }))
}

#[derive(Debug, Deserialize)]
struct DetectRequest {
    entity: String,
    value: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    lock_timeout_ms: Option<u64>,
}

impl DetectRequest {
    fn config(&self, defaults: &DetectConfig) -> DetectConfig {
        DetectConfig {
            threshold: self.threshold.unwrap_or(defaults.threshold),
            ttl_seconds: self.ttl_seconds.unwrap_or(defaults.ttl_seconds),
            lock_timeout_ms: self.lock_timeout_ms.unwrap_or(defaults.lock_timeout_ms),
            on_store_failure: defaults.on_store_failure,
        }
    }
}

async fn detect(
    State(state): State<AppState>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<Value>, ApiError> {
    let config = req.config(&state.defaults);
    let observation = Observation {
        value: req.value,
        timestamp: req.timestamp,
    };
    let result = state.detector.detect(&req.entity, &observation, &config).await?;
    Ok(Json(json!({ "data": result, "meta": meta() })))
}

async fn predict(
    State(state): State<AppState>,
    Json(call): Json<ApiCall>,
) -> Result<Json<Value>, ApiError> {
    let report = state.traffic.analyze(&call, &state.defaults).await?;
    Ok(Json(json!({ "data": report, "meta": meta() })))
}

async fn get_baseline(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let model = state
        .detector
        .baseline(&entity, state.defaults.lock_timeout())
        .await?;
    Ok(match model {
        Some(model) => (
            StatusCode::OK,
            Json(json!({
                "data": {
                    "entity": entity,
                    "count": model.count,
                    "mean": model.mean,
                    "m2": model.m2,
                    "std_dev": model.std_dev(),
                    "last_updated": model.last_updated,
                },
                "meta": meta(),
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "data": null, "meta": { "message": "no baseline for entity" } })),
        ),
    })
}

async fn delete_baseline(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .detector
        .reset(&entity, state.defaults.lock_timeout())
        .await?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}
