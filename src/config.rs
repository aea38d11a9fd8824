//! TOML configuration for the anomaly scoring service.
//!
//! Layered lookup: an explicit path, then the `ANOMALYD_CONFIG` environment
//! variable, then `/etc/anomalyd/anomalyd.toml`, then compiled-in defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::baseline::WindowPolicy;
use crate::detect::engine::{
    DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_STORE_TIMEOUT_MS, DEFAULT_THRESHOLD, DEFAULT_TTL_SECONDS,
};
use crate::detect::{DetectConfig, DetectError, StoreFailurePolicy};

pub const CONFIG_ENV_VAR: &str = "ANOMALYD_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/anomalyd/anomalyd.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration. An explicit path must load; the fallbacks
    /// only warn when present but broken.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ANOMALYD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid server.bind address '{}'", self.server.bind))?;

        if self.server.max_in_flight == 0 {
            bail!("server.max_in_flight must be greater than zero");
        }

        let d = &self.detector;
        if !d.threshold.is_finite() || d.threshold < 0.0 {
            bail!("detector.threshold must be a finite non-negative number");
        }
        if let WindowPolicy::Decay { max_samples } = d.window {
            if max_samples < 2 {
                bail!("detector.window.max_samples must be at least 2");
            }
        }
        if self.store.io_timeout_ms == 0 {
            bail!("store.io_timeout_ms must be greater than zero");
        }
        self.traffic.validate()?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Requests served concurrently; further requests wait for a slot.
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            max_in_flight: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
    /// Upper bound on a single get/set/delete.
    pub io_timeout_ms: u64,
    /// How often expired entries are purged.
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: PathBuf::from("data/anomalyd.db"),
            io_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            purge_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Scores strictly above this are anomalous.
    pub threshold: f64,
    /// Baseline expiry in the store; 0 disables expiry.
    pub ttl_seconds: u64,
    pub lock_timeout_ms: u64,
    pub on_store_failure: StoreFailurePolicy,
    pub window: WindowPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            on_store_failure: StoreFailurePolicy::Fail,
            window: WindowPolicy::Unbounded,
        }
    }
}

impl DetectorConfig {
    /// Per-call defaults handed to the detector.
    pub fn detect_config(&self) -> DetectConfig {
        DetectConfig {
            threshold: self.threshold,
            ttl_seconds: self.ttl_seconds,
            lock_timeout_ms: self.lock_timeout_ms,
            on_store_failure: self.on_store_failure,
        }
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Entity locks unused for this long are dropped.
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Traffic rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub rate_window_secs: u64,
    /// Requests per endpoint per window above which a spike is reported.
    pub rate_threshold: u64,
    pub repetitive_window_secs: u64,
    /// Requests per client and endpoint per window above which they are
    /// reported as repetitive.
    pub repetitive_threshold: usize,
    /// Expiry of learned schema hashes; 0 keeps them indefinitely.
    pub schema_ttl_seconds: u64,
}

impl TrafficConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.rate_window_secs == 0 || self.repetitive_window_secs == 0 {
            return Err(DetectError::InvalidConfig(
                "traffic windows must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: 60,
            rate_threshold: 100,
            repetitive_window_secs: 30,
            repetitive_threshold: 2,
            schema_ttl_seconds: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
