use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use anomalyd::config::{LoggingConfig, ServiceConfig};
use anomalyd::detect::{AnomalyDetector, Observation};
use anomalyd::storage::SqliteStore;

#[derive(Parser)]
#[command(
    name = "anomalyd",
    about = "Per-entity baseline anomaly scoring service",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (falls back to $ANOMALYD_CONFIG, then /etc/anomalyd/anomalyd.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + maintenance loop)
    Serve {
        /// Bind address, overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Score one value against a baseline in the local database
    Score {
        /// Entity whose baseline is scored and updated
        #[arg(long)]
        entity: String,

        /// Observed value
        #[arg(long, allow_hyphen_values = true)]
        value: f64,

        /// Anomaly threshold, overrides detector.threshold
        #[arg(long)]
        threshold: Option<f64>,

        /// SQLite database path, overrides store.sqlite_path
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Inspect or reset a stored baseline
    Baseline {
        #[command(subcommand)]
        action: BaselineAction,
    },

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum BaselineAction {
    /// Show the persisted baseline for an entity
    Show {
        #[arg(long)]
        entity: String,

        /// SQLite database path, overrides store.sqlite_path
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Delete the persisted baseline for an entity
    Reset {
        #[arg(long)]
        entity: String,

        /// SQLite database path, overrides store.sqlite_path
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn local_detector(config: &ServiceConfig, db: Option<PathBuf>) -> Result<AnomalyDetector> {
    let path = db.unwrap_or_else(|| config.store.sqlite_path.clone());
    let store = SqliteStore::open(&path, config.store.io_timeout())?;
    Ok(AnomalyDetector::new(Arc::new(store))
        .with_store_timeout(config.store.io_timeout())
        .with_window(config.detector.window))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServiceConfig::resolve(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
                config.validate()?;
            }
            tracing::info!(bind = %config.server.bind, "Starting anomalyd");
            anomalyd::serve(config).await?;
        }
        Commands::Score {
            entity,
            value,
            threshold,
            db,
        } => {
            let detector = local_detector(&config, db)?;
            let mut call = config.detector.detect_config();
            if let Some(threshold) = threshold {
                call.threshold = threshold;
            }
            let result = detector
                .detect(&entity, &Observation::new(value), &call)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Baseline { action } => match action {
            BaselineAction::Show { entity, db } => {
                let detector = local_detector(&config, db)?;
                let timeout = config.detector.detect_config().lock_timeout();
                match detector.baseline(&entity, timeout).await? {
                    Some(model) => {
                        println!("Entity:       {}", entity);
                        println!("Count:        {}", model.count);
                        println!("Mean:         {}", model.mean);
                        println!("Std dev:      {}", model.std_dev());
                        match model.last_updated {
                            Some(at) => println!("Last updated: {}", at.to_rfc3339()),
                            None => println!("Last updated: never"),
                        }
                    }
                    None => println!("No baseline for '{}'.", entity),
                }
            }
            BaselineAction::Reset { entity, db } => {
                let detector = local_detector(&config, db)?;
                let timeout = config.detector.detect_config().lock_timeout();
                if detector.reset(&entity, timeout).await? {
                    println!("Baseline '{}' reset.", entity);
                } else {
                    println!("No baseline for '{}'.", entity);
                }
            }
        },
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
