//! Mock ChangesetStore implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{ChangesetInfo, ChangesetMeta, ChangesetRecord, ChangesetState, Source};
use crate::storage::{
    ChangesetQuery, ChangesetStore, ClaimRequest, ProcessedUpdate, Result, StorageError,
};

/// Mock changeset store that keeps records in memory.
///
/// Every mutation takes the write lock for its whole duration, which makes
/// `claim` atomic.
#[derive(Default)]
pub struct MockChangesetStore {
    records: RwLock<HashMap<i64, ChangesetRecord>>,
    fail_on_claim: RwLock<bool>,
}

impl MockChangesetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent claims fail, to exercise worker error paths.
    pub async fn set_fail_on_claim(&self, fail: bool) {
        *self.fail_on_claim.write().await = fail;
    }

    /// Insert a record as-is.
    pub async fn insert(&self, record: ChangesetRecord) {
        self.records.write().await.insert(record.cid, record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn structurally_equal<T: serde::Serialize>(old: &T, new: &T) -> Result<bool> {
    Ok(serde_json::to_value(old)? == serde_json::to_value(new)?)
}

#[async_trait]
impl ChangesetStore for MockChangesetStore {
    async fn append(&self, cid: i64, source: Option<Source>) -> Result<()> {
        let record = ChangesetRecord::observed(cid, source, Utc::now());
        self.records.write().await.insert(cid, record);
        Ok(())
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<ChangesetRecord>> {
        if *self.fail_on_claim.read().await {
            return Err(StorageError::InvalidState("Mock claim failure".to_string()));
        }

        let mut records = self.records.write().await;
        let candidate = records
            .values()
            .filter(|r| request.matches(r))
            .min_by_key(|r| (request.order_by.of(r), r.cid))
            .map(|r| r.cid);

        Ok(candidate.and_then(|cid| {
            records.get_mut(&cid).map(|record| {
                record.state = request.to;
                record.state_changed = Utc::now();
                record.clone()
            })
        }))
    }

    async fn get(&self, cid: i64) -> Result<Option<ChangesetRecord>> {
        Ok(self.records.read().await.get(&cid).cloned())
    }

    async fn set_meta(&self, cid: i64, meta: &ChangesetMeta) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&cid).ok_or(StorageError::NotFound(cid))?;
        if let Some(old) = &record.meta {
            if structurally_equal(old, meta)? {
                return Ok(false);
            }
        }
        record.meta = Some(meta.clone());
        record.updated = Utc::now();
        Ok(true)
    }

    async fn set_info(&self, cid: i64, info: &ChangesetInfo) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&cid).ok_or(StorageError::NotFound(cid))?;
        if let Some(old) = &record.info {
            if structurally_equal(old, info)? {
                return Ok(false);
            }
        }
        record.info = Some(info.clone());
        record.updated = Utc::now();
        Ok(true)
    }

    async fn processed(&self, cid: i64, update: &ProcessedUpdate) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&cid).ok_or(StorageError::NotFound(cid))?;
        let now = Utc::now();
        record.state = update.state;
        record.state_changed = now;
        if update.refreshed {
            record.refreshed = now;
        }
        if let Some(labels) = &update.labels {
            record.labels = labels.clone();
        }
        if update.state != ChangesetState::Quarantined {
            record.failures = 0;
        }
        if let Some(meta) = &record.meta {
            record.updated = meta.timestamp(true).1;
        }
        Ok(())
    }

    async fn restore(&self, cid: i64, state: ChangesetState) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&cid).ok_or(StorageError::NotFound(cid))?;
        record.state = state;
        Ok(())
    }

    async fn fail(&self, cid: i64, state: ChangesetState) -> Result<u32> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&cid).ok_or(StorageError::NotFound(cid))?;
        record.state = state;
        record.failures += 1;
        Ok(record.failures)
    }

    async fn remove(&self, cid: i64) -> Result<bool> {
        Ok(self.records.write().await.remove(&cid).is_some())
    }

    async fn find(&self, query: &ChangesetQuery) -> Result<Vec<ChangesetRecord>> {
        let records = self.records.read().await;
        let mut found: Vec<ChangesetRecord> = records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        found.sort_by_key(|r| std::cmp::Reverse(query.timestamp.of(r)));
        if let Some(limit) = query.limit {
            found.truncate(limit as usize);
        }
        Ok(found)
    }

    async fn count_by_state(&self) -> Result<BTreeMap<ChangesetState, u64>> {
        let mut counts = BTreeMap::new();
        for record in self.records.read().await.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut reclaimed = 0;
        for record in self.records.write().await.values_mut() {
            if record.state_changed >= older_than {
                continue;
            }
            if let Some(recovery) = record.state.recovery_state() {
                record.state = recovery;
                record.state_changed = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn reset_states(
        &self,
        from: &[ChangesetState],
        to: ChangesetState,
        cid: Option<i64>,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut reset = 0;
        for record in self.records.write().await.values_mut() {
            if !from.is_empty() && !from.contains(&record.state) {
                continue;
            }
            if cid.is_some_and(|cid| cid != record.cid) {
                continue;
            }
            record.state = to;
            record.state_changed = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn evict_older_than(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.updated >= older_than);
        Ok((before - records.len()) as u64)
    }
}
