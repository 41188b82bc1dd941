//! Changeset content API.
//!
//! `ChangesetApi` is the seam between the analyzer and the upstream API 0.6:
//! changeset metadata, the changeset's modification stream and element
//! versions for history resolution.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::{ChangesetMeta, Element, ElementType, Modification};

pub mod http;
pub mod mock;
pub mod xml;

pub use http::OsmApiClient;
pub use mock::MockChangesetApi;

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur when talking to the changeset API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Network-level failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(_) => true,
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<quick_xml::Error> for ApiError {
    fn from(e: quick_xml::Error) -> Self {
        ApiError::Parse(e.to_string())
    }
}

/// Upstream changeset content API.
#[async_trait]
pub trait ChangesetApi: Send + Sync {
    /// Changeset metadata including its discussion.
    async fn changeset(&self, cid: i64) -> Result<ChangesetMeta>;

    /// Every modification made by the changeset, in upload order.
    async fn changeset_download(&self, cid: i64) -> Result<Vec<Modification>>;

    /// One element version, the current one if `version` is `None`.
    /// `None` if the element (or version) is gone.
    async fn element(
        &self,
        element_type: ElementType,
        id: i64,
        version: Option<u32>,
    ) -> Result<Option<Element>>;

    /// Every version of an element, keyed by version number.
    async fn element_history(
        &self,
        element_type: ElementType,
        id: i64,
    ) -> Result<BTreeMap<u32, Element>>;
}
