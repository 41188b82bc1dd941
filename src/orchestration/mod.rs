//! Changeset state machine.
//!
//! Records move between states only through the store's atomic claim:
//! - `steps`: one function per transition, each claiming a single record,
//!   recomputing its output and releasing it (or rolling it back)
//! - `worker`: the claim loop, timeout sweeps and bus handlers
//!
//! ```text
//! NEW -> BOUNDS_CHECK -> BOUNDS_CHECKED | removed | QUARANTINED
//! BOUNDS_CHECKED -> ANALYZING1 -> OPEN | CLOSED
//! OPEN (stale) -> ANALYZING1 -> OPEN | CLOSED
//! CLOSED -> ANALYZING2 -> DONE
//! DONE (stale) -> REANALYZING -> DONE
//! ```

use crate::analysis::AnalysisError;
use crate::bus::BusError;
use crate::osmapi::ApiError;
use crate::replication::FetchError;
use crate::storage::StorageError;

pub mod steps;
pub mod worker;

pub use steps::{ClaimGuard, Pipeline};
pub use worker::{Worker, WorkerHandle};

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP or timeout talking upstream. Retried later, nothing mutated.
    TransientNetwork,
    /// Processing budget exceeded. Partial results are kept.
    Timeout,
    /// Malformed or incomplete upstream payload.
    UpstreamData,
    /// One changeset keeps failing. It is quarantined.
    PermanentChangeset,
    Storage,
    /// Shutdown arrived mid-step.
    Interrupted,
}

/// Errors that can occur while driving changesets through the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Changeset {0} has no metadata")]
    MissingMeta(i64),

    #[error("Interrupted while processing changeset {0}")]
    Interrupted(i64),
}

/// Changeset API failures left after the client's own retries are specific
/// to the changeset unless they look like an outage.
fn api_kind(e: &ApiError) -> ErrorKind {
    if e.is_transient() {
        ErrorKind::TransientNetwork
    } else {
        ErrorKind::PermanentChangeset
    }
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::Storage(_) => ErrorKind::Storage,
            TrackerError::Analysis(e) => match e {
                AnalysisError::Timeout(_) => ErrorKind::Timeout,
                AnalysisError::NotFound { .. } => ErrorKind::PermanentChangeset,
                AnalysisError::Api(api) => api_kind(api),
                AnalysisError::Rule(_) | AnalysisError::Area { .. } => ErrorKind::UpstreamData,
            },
            TrackerError::Api(e) => api_kind(e),
            TrackerError::Fetch(e) if e.is_transient() => ErrorKind::TransientNetwork,
            TrackerError::Fetch(FetchError::Storage(_)) => ErrorKind::Storage,
            TrackerError::Fetch(_) => ErrorKind::UpstreamData,
            TrackerError::Bus(_) => ErrorKind::TransientNetwork,
            TrackerError::MissingMeta(_) => ErrorKind::UpstreamData,
            TrackerError::Interrupted(_) => ErrorKind::Interrupted,
        }
    }

    /// The changeset should be set aside instead of retried.
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::PermanentChangeset
    }
}
