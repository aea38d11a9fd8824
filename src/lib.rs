//! anomalyd -- per-entity baseline anomaly scoring.
//!
//! This crate provides the detection core (Welford baselines, a per-entity
//! lock table and a pluggable baseline store), an API-traffic analyzer built
//! on it, and the HTTP service that exposes both.

pub mod api;
pub mod baseline;
pub mod config;
pub mod detect;
pub mod storage;
pub mod traffic;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::detect::{AnomalyDetector, TracingHook};
use crate::traffic::TrafficAnalyzer;

/// Build the detector described by `config` on top of its configured store.
pub fn build_detector(config: &ServiceConfig) -> Result<Arc<AnomalyDetector>> {
    let store = storage::open_store(&config.store)?;
    let detector = AnomalyDetector::new(store)
        .with_store_timeout(config.store.io_timeout())
        .with_window(config.detector.window)
        .with_hook(Arc::new(TracingHook));
    Ok(Arc::new(detector))
}

/// Start the service: API server plus background maintenance.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    // 1. Initialize Storage + Detector
    let detector = build_detector(&config)?;
    let traffic = Arc::new(TrafficAnalyzer::new(detector.clone(), config.traffic.clone()));

    // 2. Start maintenance loop (background task)
    tokio::spawn(run_maintenance_loop(detector.clone(), config.clone()));

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState {
        detector,
        traffic,
        defaults: config.detector.detect_config(),
    })
    .layer(ConcurrencyLimitLayer::new(config.server.max_in_flight));

    info!(%addr, "anomalyd listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("anomalyd stopped");
    Ok(())
}

/// Periodically evict idle entity locks and purge expired store entries.
pub async fn run_maintenance_loop(detector: Arc<AnomalyDetector>, config: ServiceConfig) {
    info!("maintenance loop started");

    let idle_ttl = Duration::from_secs(config.locks.idle_ttl_secs);
    let mut sweep = tokio::time::interval(Duration::from_secs(config.locks.sweep_interval_secs.max(1)));
    let mut purge = tokio::time::interval(Duration::from_secs(config.store.purge_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let evicted = detector.locks().sweep_idle(idle_ttl);
                debug!(evicted, live = detector.locks().len(), "lock sweep");
            }
            _ = purge.tick() => {
                match detector.store().purge_expired().await {
                    Ok(removed) => debug!(removed, "store purge"),
                    Err(e) => warn!(error = %e, "store purge failed"),
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
