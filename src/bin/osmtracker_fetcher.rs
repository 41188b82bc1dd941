//! osmtracker-fetcher: replication feed tracker
//!
//! Follows the configured replication feed and queues every changeset it
//! sees in state NEW.
//!
//! ## Architecture
//! ```text
//! [planet replication] --(HTTP)--> [osmtracker-fetcher] --> changeset store
//!                                          |
//!                                          +--(new_cset, new_pointer)--> bus (optional)
//! ```
//!
//! ## Configuration
//! - `--config <path>` or OSMTRACKER_CONFIG: YAML configuration file
//! - OSMTRACKER_INITPTR: reset the pointer to one step behind head before tracking
//! - OSMTRACKER_HISTORY: RFC 3339 timestamp; start tracking from the feed
//!   state at or before it
//! - OSMTRACKER_SIMULATE: queue this changeset id as if observed, then exit

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use osmtracker::bus::{init_bus, MessageBus};
use osmtracker::config::Config;
use osmtracker::replication::Fetcher;
use osmtracker::storage::init_storage;
use osmtracker::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

const INITPTR_ENV_VAR: &str = "OSMTRACKER_INITPTR";
const HISTORY_ENV_VAR: &str = "OSMTRACKER_HISTORY";
const SIMULATE_ENV_VAR: &str = "OSMTRACKER_SIMULATE";

/// Upper bound on the backward walk when locating a history start.
const LOCATE_MAX_ITER: u64 = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(feed = %config.tracker.feed_type, "Starting osmtracker-fetcher");

    let (changesets, context) =
        connect_with_retry("storage", || init_storage(&config.storage)).await?;
    info!("Storage initialized");

    let fetcher = Fetcher::from_config(&config.tracker);

    if let Ok(cid) = std::env::var(SIMULATE_ENV_VAR) {
        let cid: i64 = cid
            .parse()
            .map_err(|e| format!("{} must be a changeset id: {}", SIMULATE_ENV_VAR, e))?;
        fetcher.simulate(changesets.as_ref(), cid).await?;
        return Ok(());
    }

    if std::env::var(INITPTR_ENV_VAR).is_ok() {
        let position = fetcher.initial_pointer().await?;
        let pointer = context.set_pointer(&position).await?;
        info!(seqno = pointer.seqno, timestamp = %pointer.timestamp, "Pointer reset to head");
    } else if let Ok(history) = std::env::var(HISTORY_ENV_VAR) {
        let target: DateTime<Utc> = DateTime::parse_from_rfc3339(&history)
            .map_err(|e| format!("{} must be an RFC 3339 timestamp: {}", HISTORY_ENV_VAR, e))?
            .with_timezone(&Utc);
        let head = fetcher.head().await?;
        let state = fetcher
            .locate(target, &head, Some(LOCATE_MAX_ITER))
            .await?
            .ok_or_else(|| format!("No feed state found at or before {}", target))?;
        let pointer = context.set_pointer(&state.position()).await?;
        info!(seqno = pointer.seqno, timestamp = %pointer.timestamp, "Pointer set from history");
    }

    let bus: Option<Arc<dyn MessageBus>> = match &config.messaging {
        Some(messaging) => Some(connect_with_retry("bus", || init_bus(messaging)).await?),
        None => None,
    };

    let handle = fetcher.spawn(changesets, context, bus);

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    handle.shutdown().await;

    Ok(())
}
