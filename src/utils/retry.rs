//! Retry utilities: backoff builders for upstream HTTP calls and broker
//! connections.
//!
//! Uses `backon`. Feed requests retry on a fixed delay so the pointer loop
//! stays predictable; API and connection retries back off exponentially.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

/// Backoff for replication feed requests.
///
/// - Delay: 2s
/// - Max attempts: 3
pub fn feed_backoff() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_secs(2))
        .with_max_times(3)
}

/// Backoff for changeset API requests.
///
/// - Min delay: 500ms
/// - Max delay: 10s
/// - Max attempts: 4
/// - Jitter enabled
pub fn api_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(4)
        .with_jitter()
}

/// Backoff for storage and broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
