//! Changeset analysis.
//!
//! This module contains:
//! - `ElementCache`: element version history with on-demand upstream fetches
//! - `SummaryBuilder` / `DiffListBuilder`: per-modification counters, tag
//!   diffs, mileage and human-readable notes
//! - `geojson_diff`: map features for a changeset
//! - `LabelRule`: regex and area predicates producing changeset labels
//! - `Analyzer`: the light and deep passes run by the orchestrator

use std::time::{Duration, Instant};

use crate::osmapi::ApiError;

pub mod analyzer;
pub mod colour;
pub mod diffs;
pub mod geo;
pub mod geojson;
pub mod history;
pub mod labels;
pub mod poly;
pub mod summary;
pub mod tagdiff;

pub use analyzer::{Analyzer, DeepAnalysis};
pub use colour::ColourScheme;
pub use diffs::DiffListBuilder;
pub use history::{ElementCache, VersionRef};
pub use labels::{build_labels, passes_prefilter, LabelContext, LabelRule};
pub use poly::Polygon;
pub use summary::SummaryBuilder;

/// Result type for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors that can occur while analyzing a changeset.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Element not found: {element_type} {id} version {version}")]
    NotFound {
        element_type: String,
        id: i64,
        version: String,
    },

    #[error("Processing time budget of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Invalid label rule: {0}")]
    Rule(String),

    #[error("Failed to read area file {path}: {source}")]
    Area {
        path: String,
        source: std::io::Error,
    },

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

/// Wall-clock processing budget for one changeset.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: Instant,
    max: Option<Duration>,
}

impl Budget {
    pub fn new(max: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            max,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Fail with `Timeout` once the budget is used up.
    pub fn check(&self) -> Result<()> {
        match self.max {
            Some(max) if self.started.elapsed() > max => Err(AnalysisError::Timeout(max)),
            _ => Ok(()),
        }
    }
}
