use anyhow::Result;
use log::{error, info, warn};
use patrol_pipeline::api::RestApi;
use patrol_pipeline::config::load_config;
use patrol_pipeline::db;
use patrol_pipeline::detector::HttpDetector;
use patrol_pipeline::messaging::broker::{create_message_broker, spawn_event_mirror};
use patrol_pipeline::services::Pipeline;
use patrol_pipeline::storage::LocalBlobStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Config file from the first argument, then `PATROL_CONFIG`
fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("PATROL_CONFIG").map(PathBuf::from))
}

async fn run_app() -> Result<()> {
    let config = load_config(config_path().as_deref())?;

    // Initialize logging; RUST_LOG wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.api.log_level.as_str()),
    )
    .init();
    info!("Starting patrol ingestion pipeline");

    let store = db::open_store(&config.database).await?;
    info!("Record store ready");

    let blobs = Arc::new(LocalBlobStore::new(&config.storage).await?);
    let detector = Arc::new(HttpDetector::new(&config.analysis.detector_url)?);
    info!("Detector endpoint: {}", config.analysis.detector_url);

    let pipeline = Arc::new(Pipeline::new(store, blobs, detector, &config));

    // The broker only mirrors the change feed, so the pipeline runs without it
    if config.message_broker.enabled {
        match create_message_broker(config.message_broker.clone()).await {
            Ok(broker) => {
                spawn_event_mirror(broker, &pipeline.distributor);
                info!("Message broker initialized");
            }
            Err(e) => warn!("Message broker unavailable, events stay local: {}", e),
        }
    }

    let background = pipeline.start().await?;

    let http_server = RestApi::new(&config.api, pipeline.clone());

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!("API server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    for task in background {
        task.abort();
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        error!("Fatal error: {:#}", e);
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
