//! osmtracker-worker: changeset analysis worker
//!
//! Claims changesets from the store and drives them through filtering,
//! light analysis and deep analysis until DONE. Several workers may share
//! one store; the atomic claim keeps them from working on the same record.
//!
//! ## Architecture
//! ```text
//! changeset store <--(claim/processed)--> [osmtracker-worker] --(HTTP)--> changeset API
//!                                                 ^
//!                 bus (optional) --(new_cset, analysis_cset, refresh_cset)
//! ```
//!
//! Without a bus the worker polls every `tracker.poll_interval_secs`. With a
//! bus, messages trigger their steps right away and polling still picks up
//! refreshes and anything a message missed.
//!
//! ## Configuration
//! - `--config <path>` or OSMTRACKER_CONFIG: YAML configuration file
//! - OSMTRACKER_REGION: polygon file used by every area label rule

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use osmtracker::analysis::Analyzer;
use osmtracker::bus::init_bus;
use osmtracker::config::Config;
use osmtracker::orchestration::{Pipeline, Worker};
use osmtracker::osmapi::OsmApiClient;
use osmtracker::storage::init_storage;
use osmtracker::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting osmtracker-worker");

    let (changesets, context) =
        connect_with_retry("storage", || init_storage(&config.storage)).await?;
    info!("Storage initialized");

    let api = Arc::new(OsmApiClient::from_config(&config.tracker));
    let analyzer = Arc::new(Analyzer::new(api, &config.tracker)?);

    let mut pipeline = Pipeline::new(changesets, context, analyzer, &config.tracker);
    let bus = match &config.messaging {
        Some(messaging) => Some(connect_with_retry("bus", || init_bus(messaging)).await?),
        None => None,
    };
    if let Some(bus) = &bus {
        pipeline = pipeline.with_bus(bus.clone());
    }

    let worker = Worker::new(
        Arc::new(pipeline),
        Duration::from_secs(config.tracker.poll_interval_secs),
    );

    // Bus handlers roll back their claimed changeset on this signal.
    let (bus_shutdown_tx, bus_shutdown_rx) = watch::channel(false);
    if let Some(bus) = &bus {
        worker.subscribe(bus.as_ref(), bus_shutdown_rx).await?;
        info!("Subscribed to work topics");
    }

    let handle = worker.spawn();

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    let _ = bus_shutdown_tx.send(true);
    handle.shutdown().await;

    Ok(())
}
