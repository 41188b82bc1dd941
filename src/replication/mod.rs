//! Replication feed fetcher.
//!
//! Turns the persisted replication pointer into an ordered, gap-free stream
//! of newly observed changesets:
//! - `path`: sequence number to `aaa/bbb/ccc` path fragment mapping
//! - `state`: state document parsing (`state.txt` and the changesets YAML)
//! - `diff`: changeset extraction from gzip-compressed diff payloads
//! - `client`: HTTP access to the feed with timeouts and retry
//! - `fetcher`: `advance`, `locate` and the tracking loop

pub mod client;
pub mod diff;
pub mod fetcher;
pub mod path;
pub mod state;

pub use client::ReplicationClient;
pub use fetcher::{Advance, Fetcher, FetcherHandle, Observation, SIMULATED_SEQNO};
pub use path::{parse_path_fragment, path_fragment};
pub use state::ReplicationState;

use crate::storage::StorageError;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors that can occur while talking to the replication feed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("State document is missing {0}")]
    MissingField(&'static str),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FetchError {
    /// Network-level failures that are worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) | FetchError::Io(_) => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
