//! Changeset store.
//!
//! This module contains:
//! - `ChangesetStore` trait: keyed changeset records with the atomic claim
//! - `ContextStore` trait: replication pointer and generation counter singletons
//! - Implementations: SQLite, in-memory mock

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::model::{
    ChangesetInfo, ChangesetMeta, ChangesetRecord, ChangesetState, PointerPosition,
    ReplicationPointer, Source,
};

pub mod mock;
pub mod schema;
pub mod sqlite;

pub use mock::{MockChangesetStore, MockContextStore};
pub use sqlite::{SqliteChangesetStore, SqliteContextStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Changeset not found: {0}")]
    NotFound(i64),

    #[error("Replication pointer not set")]
    NoPointer,

    #[error("Invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: String, value: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timestamp column of a changeset record used for filtering and ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampColumn {
    #[default]
    Queued,
    Updated,
    Refreshed,
    StateChanged,
}

impl TimestampColumn {
    pub fn of(&self, record: &ChangesetRecord) -> DateTime<Utc> {
        match self {
            TimestampColumn::Queued => record.queued,
            TimestampColumn::Updated => record.updated,
            TimestampColumn::Refreshed => record.refreshed,
            TimestampColumn::StateChanged => record.state_changed,
        }
    }
}

/// Parameters of an atomic claim.
///
/// Selects the record in one of `from` with the oldest `order_by`
/// timestamp, optionally restricted to `timestamp < before`, and moves it to
/// `to`. Records listed in `skip` are never selected.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub from: Vec<ChangesetState>,
    pub to: ChangesetState,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub timestamp: TimestampColumn,
    pub order_by: TimestampColumn,
    pub skip: Vec<i64>,
}

impl ClaimRequest {
    pub fn new(from: ChangesetState, to: ChangesetState) -> Self {
        Self {
            from: vec![from],
            to,
            before: None,
            after: None,
            timestamp: TimestampColumn::StateChanged,
            order_by: TimestampColumn::Queued,
            skip: Vec::new(),
        }
    }

    /// Only claim records whose `column` is older than `before`, oldest first.
    pub fn stale(mut self, column: TimestampColumn, before: DateTime<Utc>) -> Self {
        self.timestamp = column;
        self.order_by = column;
        self.before = Some(before);
        self
    }

    /// Never claim any of `cids`.
    pub fn skipping(mut self, cids: impl IntoIterator<Item = i64>) -> Self {
        self.skip.extend(cids);
        self
    }

    pub fn matches(&self, record: &ChangesetRecord) -> bool {
        if !self.from.contains(&record.state) || self.skip.contains(&record.cid) {
            return false;
        }
        let ts = self.timestamp.of(record);
        self.before.map_or(true, |before| ts < before) && self.after.map_or(true, |after| ts > after)
    }
}

/// Changes applied when a step finishes with a record.
#[derive(Debug, Clone)]
pub struct ProcessedUpdate {
    pub state: ChangesetState,
    /// Also stamp `refreshed`.
    pub refreshed: bool,
    /// Replace the label set.
    pub labels: Option<Vec<String>>,
}

impl ProcessedUpdate {
    pub fn state(state: ChangesetState) -> Self {
        Self {
            state,
            refreshed: false,
            labels: None,
        }
    }

    pub fn refreshed(mut self) -> Self {
        self.refreshed = true;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// Range query over changeset records. Results are sorted newest first.
#[derive(Debug, Clone, Default)]
pub struct ChangesetQuery {
    /// Empty matches every state.
    pub states: Vec<ChangesetState>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub timestamp: TimestampColumn,
    pub limit: Option<u64>,
}

impl ChangesetQuery {
    pub fn in_states(states: &[ChangesetState]) -> Self {
        Self {
            states: states.to_vec(),
            timestamp: TimestampColumn::Updated,
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ChangesetRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&record.state) {
            return false;
        }
        let ts = self.timestamp.of(record);
        self.before.map_or(true, |before| ts < before) && self.after.map_or(true, |after| ts >= after)
    }
}

/// Storage interface for changeset records.
///
/// `claim` is the only coordination primitive between workers: it must be
/// atomic, so two concurrent callers never receive the same record.
#[async_trait]
pub trait ChangesetStore: Send + Sync {
    /// Insert or replace a record in state NEW with all timestamps set to now.
    async fn append(&self, cid: i64, source: Option<Source>) -> Result<()>;

    /// Atomically move one matching record to `request.to` and return it.
    async fn claim(&self, request: &ClaimRequest) -> Result<Option<ChangesetRecord>>;

    async fn get(&self, cid: i64) -> Result<Option<ChangesetRecord>>;

    /// Store metadata. Returns false, without writing, if it is structurally
    /// equal to the stored value. A write also bumps `updated`.
    async fn set_meta(&self, cid: i64, meta: &ChangesetMeta) -> Result<bool>;

    /// Store analysis info, with the same change gating as `set_meta`.
    async fn set_info(&self, cid: i64, info: &ChangesetInfo) -> Result<bool>;

    /// Finish a step: set state and `state_changed`, optionally `refreshed`
    /// and labels. `updated` is derived from the stored metadata timestamp,
    /// discussion included. Any state but QUARANTINED clears `failures`.
    async fn processed(&self, cid: i64, update: &ProcessedUpdate) -> Result<()>;

    /// Roll a claimed record back to `state` without touching anything else.
    async fn restore(&self, cid: i64, state: ChangesetState) -> Result<()>;

    /// Roll a claimed record back to `state` after a failed step and count
    /// the failure. Returns the new failure count.
    async fn fail(&self, cid: i64, state: ChangesetState) -> Result<u32>;

    /// Delete a record. Returns false if it did not exist.
    async fn remove(&self, cid: i64) -> Result<bool>;

    async fn find(&self, query: &ChangesetQuery) -> Result<Vec<ChangesetRecord>>;

    async fn count_by_state(&self) -> Result<BTreeMap<ChangesetState, u64>>;

    /// Return records stuck in a transient state since before `older_than`
    /// to their recovery state.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Move records in any of `from` (or only `cid`) to `to`.
    async fn reset_states(
        &self,
        from: &[ChangesetState],
        to: ChangesetState,
        cid: Option<i64>,
    ) -> Result<u64>;

    /// Delete every record whose `updated` is older than `older_than`.
    async fn evict_older_than(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Storage interface for the replication pointer and generation counter.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn pointer(&self) -> Result<Option<ReplicationPointer>>;

    /// Set the pointer. The first call also records `first_pointer`.
    async fn set_pointer(&self, position: &PointerPosition) -> Result<ReplicationPointer>;

    async fn pointer_update_timestamp(&self, timestamp: DateTime<Utc>) -> Result<()>;

    /// Move the pointer by `offset` sequence numbers.
    async fn pointer_advance(&self, offset: i64) -> Result<ReplicationPointer>;

    /// Current generation, 0 if never advanced.
    async fn generation(&self) -> Result<u64>;

    /// Increment the generation and return the new value.
    async fn generation_advance(&self) -> Result<u64>;
}

/// Changeset and context store handles.
pub type Stores = (Arc<dyn ChangesetStore>, Arc<dyn ContextStore>);

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Stores> {
    match config.storage_type {
        StorageType::Sqlite => {
            info!(path = %config.sqlite.path, "Storage: sqlite");

            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(config.sqlite.max_connections)
                .connect(&format!("sqlite:{}?mode=rwc", config.sqlite.path))
                .await?;

            let changesets = Arc::new(SqliteChangesetStore::new(pool.clone()));
            changesets.init().await?;

            let context = Arc::new(SqliteContextStore::new(pool));
            context.init().await?;

            Ok((changesets, context))
        }
        StorageType::Memory => {
            info!("Storage: memory");
            Ok((
                Arc::new(MockChangesetStore::new()),
                Arc::new(MockContextStore::new()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: ChangesetState, age_secs: i64) -> ChangesetRecord {
        let ts = Utc::now() - chrono::Duration::seconds(age_secs);
        let mut record = ChangesetRecord::observed(1, None, ts);
        record.state = state;
        record
    }

    #[test]
    fn test_claim_request_matches_state() {
        let request = ClaimRequest::new(ChangesetState::New, ChangesetState::BoundsCheck);
        assert!(request.matches(&record(ChangesetState::New, 0)));
        assert!(!request.matches(&record(ChangesetState::Done, 0)));
    }

    #[test]
    fn test_claim_request_stale_filter() {
        let cutoff = Utc::now() - chrono::Duration::seconds(300);
        let request = ClaimRequest::new(ChangesetState::Open, ChangesetState::Analyzing1)
            .stale(TimestampColumn::Refreshed, cutoff);
        assert_eq!(request.order_by, TimestampColumn::Refreshed);
        assert!(request.matches(&record(ChangesetState::Open, 600)));
        assert!(!request.matches(&record(ChangesetState::Open, 10)));
    }

    #[test]
    fn test_claim_request_skips_listed_cids() {
        let request = ClaimRequest::new(ChangesetState::New, ChangesetState::BoundsCheck)
            .skipping([1]);
        assert!(!request.matches(&record(ChangesetState::New, 0)));
    }

    #[test]
    fn test_query_without_states_matches_all() {
        let query = ChangesetQuery::default();
        for state in ChangesetState::ALL {
            assert!(query.matches(&record(state, 0)));
        }
    }
}
