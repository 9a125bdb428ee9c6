//! Acquisition service entry point
//!
//! Loads the YAML configuration, initializes tracing, wires the sinks and
//! starts the runtime. The process stays up until SIGINT/SIGTERM and shuts
//! down gracefully.

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};

use acqsrv::config::{ConfigCache, FileConfigProvider};
use acqsrv::runtime::{wait_for_shutdown, Collaborators, Runtime};
use acqsrv::sinks::influx::InfluxSink;
use acqsrv::sinks::mqtt::MqttPublisher;
use acqsrv::utils::error::Result;

/// Command line arguments
#[derive(Parser)]
#[command(
    name = "acqsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Field-bus data acquisition service"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/acqsrv.yaml")]
    config: String,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // No .env file is the normal case outside development
    let _ = dotenv();

    let config_file = std::env::var("CONFIG_FILE").unwrap_or(args.config);
    let provider = Arc::new(FileConfigProvider::load(&config_file)?);
    let config_cache = ConfigCache::new(provider).await;
    let config = config_cache.snapshot().await;

    let level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    info!(
        "starting {} v{} with configuration {}",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        config_file
    );

    let mut collaborators = Collaborators::default();

    if config.influx.enabled {
        info!(url = %config.influx.url, bucket = %config.influx.bucket, "time-series sink enabled");
        collaborators.sink = Some(Arc::new(InfluxSink::new(&config.influx)));
    } else {
        warn!("time-series sink disabled, samples will not be persisted");
    }

    // The broker event loop outlives the runtime by one cancel so queued
    // QoS-1 publishes can still drain
    let broker_token = tokio_util::sync::CancellationToken::new();
    if config.mqtt.enabled {
        info!(host = %config.mqtt.host, port = config.mqtt.port, "broker publishing enabled");
        collaborators.broker = Some(Arc::new(MqttPublisher::new(
            &config.mqtt,
            broker_token.clone(),
        )));
    }

    let runtime = Runtime::start(config.clone(), collaborators).await?;

    info!("service started, waiting for shutdown signal");
    wait_for_shutdown().await;

    runtime.shutdown().await;
    broker_token.cancel();
    info!("bye");
    Ok(())
}
