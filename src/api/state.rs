use std::sync::Arc;

use crate::detect::{AnomalyDetector, DetectConfig};
use crate::traffic::TrafficAnalyzer;

#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<AnomalyDetector>,
    pub traffic: Arc<TrafficAnalyzer>,
    /// Applied to fields a request leaves out.
    pub defaults: DetectConfig,
}
