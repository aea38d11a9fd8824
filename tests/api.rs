//! HTTP API tests driven through the router with `tower::ServiceExt`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use anomalyd::api::{self, state::AppState};
use anomalyd::config::TrafficConfig;
use anomalyd::detect::{AnomalyDetector, DetectConfig};
use anomalyd::storage::MemoryStore;
use anomalyd::traffic::TrafficAnalyzer;

fn app_with(store: Arc<MemoryStore>) -> Router {
    let detector = Arc::new(AnomalyDetector::new(store));
    let traffic = Arc::new(TrafficAnalyzer::new(detector.clone(), TrafficConfig::default()));
    api::router(AppState {
        detector,
        traffic,
        defaults: DetectConfig::default(),
    })
}

fn app() -> Router {
    app_with(Arc::new(MemoryStore::new()))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(
        &app(),
        Request::get("/api/v1/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["meta"]["request_id"].is_string());
}

#[tokio::test]
async fn test_detect_flow() {
    let app = app();
    for v in [100.0, 102.0, 98.0, 101.0, 99.0] {
        let (status, body) =
            send(&app, post("/api/v1/detect", json!({ "entity": "cpu", "value": v }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["anomalous"], false);
    }

    let (status, body) = send(
        &app,
        post("/api/v1/detect", json!({ "entity": "cpu", "value": 500.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["anomalous"], true);
    assert_eq!(body["data"]["baseline"]["count"], 5);
    assert_eq!(body["data"]["severity"], "critical");

    let (status, body) = send(
        &app,
        Request::get("/api/v1/baselines/cpu").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 6);
}

#[tokio::test]
async fn test_detect_rejects_bad_input() {
    let app = app();
    let (status, body) =
        send(&app, post("/api/v1/detect", json!({ "entity": " ", "value": 1.0 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "invalid_observation");
    assert_eq!(body["error"]["retryable"], false);

    let (status, body) = send(
        &app,
        post(
            "/api/v1/detect",
            json!({ "entity": "e", "value": 1.0, "threshold": -2.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "invalid_config");
}

#[tokio::test]
async fn test_store_outage_is_503() {
    let store = Arc::new(MemoryStore::new());
    let app = app_with(store.clone());
    store.set_offline(true);

    let (status, body) =
        send(&app, post("/api/v1/detect", json!({ "entity": "e", "value": 1.0 }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "store_unavailable");
    assert_eq!(body["error"]["retryable"], true);
}

#[tokio::test]
async fn test_baseline_lookup_and_reset() {
    let app = app();
    let get = || Request::get("/api/v1/baselines/mem").body(Body::empty()).unwrap();
    let delete = || {
        Request::delete("/api/v1/baselines/mem")
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = send(&app, get()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&app, post("/api/v1/detect", json!({ "entity": "mem", "value": 1.0 }))).await;
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_predict_reports_findings() {
    let app = app();
    let call = |id: &str, rt: f64, schema: &str, client: &str| {
        json!({
            "request_id": id,
            "timestamp_utc": "2026-03-01T12:00:00Z",
            "endpoint": "/v1/users",
            "http_method": "GET",
            "status_code": 200,
            "response_time_ms": rt,
            "client_ip": client,
            "schema_hash": schema,
        })
    };

    let (status, body) = send(&app, post("/api/v1/predict", call("r1", 20.0, "a", "c1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_anomaly"], false);
    assert_eq!(body["data"]["request_id"], "r1");

    let (status, body) = send(&app, post("/api/v1/predict", call("r2", 21.0, "b", "c2"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_anomaly"], true);
    assert_eq!(body["data"]["findings"][0]["type"], "NEW_RESPONSE_SCHEMA");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (status, _) = send(
        &app(),
        Request::get("/api/v1/nope").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
