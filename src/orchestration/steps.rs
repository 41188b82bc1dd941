//! State machine steps.
//!
//! Every step claims at most one record and recomputes its output from
//! scratch, so a step can be retried after any failure. Each returns the
//! cid it worked on, or `None` when nothing was claimable. Records whose cid
//! is in `attempted` are not claimed, and the claimed cid is added to it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Result, TrackerError};
use crate::analysis::Analyzer;
use crate::bus::{notify_generation, publish_cset, MessageBus, Topic};
use crate::config::TrackerConfig;
use crate::model::{ChangesetInfo, ChangesetMeta, ChangesetRecord, ChangesetState};
use crate::storage::{
    ChangesetStore, ClaimRequest, ContextStore, ProcessedUpdate, TimestampColumn,
};

/// Wait until shutdown is signalled. Never returns if the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A record owned by this worker until the step finishes.
///
/// If shutdown interrupts the step, the record goes back to the state it was
/// claimed from. If the step fails, the record also goes back and the
/// failure is counted; a permanent error or `max_failures` failures
/// quarantine it instead.
pub struct ClaimGuard {
    store: Arc<dyn ChangesetStore>,
    record: ChangesetRecord,
    source: ChangesetState,
    max_failures: u32,
}

impl ClaimGuard {
    pub async fn acquire(
        store: Arc<dyn ChangesetStore>,
        request: &ClaimRequest,
        max_failures: u32,
    ) -> Result<Option<Self>> {
        let Some(source) = request.from.first().copied() else {
            return Ok(None);
        };
        let Some(record) = store.claim(request).await? else {
            return Ok(None);
        };
        debug!(cid = record.cid, from = %source, to = %request.to, "Claimed changeset");
        Ok(Some(Self {
            store,
            record,
            source,
            max_failures,
        }))
    }

    pub fn cid(&self) -> i64 {
        self.record.cid
    }

    pub fn record(&self) -> &ChangesetRecord {
        &self.record
    }

    /// Run `work` on the claimed record, rolling back on error or shutdown.
    pub async fn run<T, F, Fut>(self, shutdown: &mut watch::Receiver<bool>, work: F) -> Result<T>
    where
        F: FnOnce(ChangesetRecord) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Self {
            store,
            record,
            source,
            max_failures,
        } = self;
        let cid = record.cid;
        let outcome = tokio::select! {
            biased;
            _ = shutdown_signalled(shutdown) => Err(TrackerError::Interrupted(cid)),
            result = work(record) => result,
        };

        match &outcome {
            Ok(_) => {}
            Err(TrackerError::Interrupted(_)) => {
                debug!(cid, state = %source, "Step interrupted, restoring changeset");
                if let Err(restore_err) = store.restore(cid, source).await {
                    error!(cid, error = %restore_err, "Failed to restore changeset");
                }
            }
            Err(e) => record_failure(store.as_ref(), cid, source, max_failures, e).await,
        }
        outcome
    }
}

/// Roll a failed record back and count the failure, or quarantine it once
/// the error is permanent or it has failed `max_failures` times.
async fn record_failure(
    store: &dyn ChangesetStore,
    cid: i64,
    source: ChangesetState,
    max_failures: u32,
    e: &TrackerError,
) {
    let failures = match store.fail(cid, source).await {
        Ok(failures) => failures,
        Err(restore_err) => {
            error!(cid, error = %restore_err, "Failed to restore changeset");
            return;
        }
    };
    if !e.is_permanent() && failures < max_failures {
        warn!(cid, state = %source, failures, error = %e, "Step failed, restoring changeset");
        return;
    }

    error!(cid, failures, kind = ?e.kind(), error = %e, "Step failed, quarantining changeset");
    if let Err(quarantine_err) = store
        .processed(cid, &ProcessedUpdate::state(ChangesetState::Quarantined))
        .await
    {
        error!(cid, error = %quarantine_err, "Failed to quarantine changeset");
    }
}

/// What the filter step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Passed,
    Dropped,
    Quarantined,
}

/// Shared state of the steps.
pub struct Pipeline {
    changesets: Arc<dyn ChangesetStore>,
    context: Arc<dyn ContextStore>,
    analyzer: Arc<Analyzer>,
    bus: Option<Arc<dyn MessageBus>>,
    refresh_open: chrono::Duration,
    refresh_meta: chrono::Duration,
    horizon: chrono::Duration,
    claim_timeout: chrono::Duration,
    max_failures: u32,
}

impl Pipeline {
    pub fn new(
        changesets: Arc<dyn ChangesetStore>,
        context: Arc<dyn ContextStore>,
        analyzer: Arc<Analyzer>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            changesets,
            context,
            analyzer,
            bus: None,
            refresh_open: chrono::Duration::minutes(config.refresh_open_minutes),
            refresh_meta: chrono::Duration::minutes(config.refresh_meta_minutes),
            horizon: chrono::Duration::hours(config.horizon_hours),
            claim_timeout: chrono::Duration::seconds(config.claim_timeout_secs),
            max_failures: config.max_failures,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn changesets(&self) -> &Arc<dyn ChangesetStore> {
        &self.changesets
    }

    pub fn context(&self) -> &Arc<dyn ContextStore> {
        &self.context
    }

    async fn claim(
        &self,
        request: ClaimRequest,
        attempted: &mut HashSet<i64>,
    ) -> Result<Option<ClaimGuard>> {
        let request = request.skipping(attempted.iter().copied());
        let guard =
            ClaimGuard::acquire(self.changesets.clone(), &request, self.max_failures).await?;
        if let Some(guard) = &guard {
            attempted.insert(guard.cid());
        }
        Ok(guard)
    }

    /// Advance the generation counter and broadcast it.
    async fn new_generation(&self) -> Result<u64> {
        let generation = self.context.generation_advance().await?;
        debug!(generation, "New generation");
        if let Some(bus) = &self.bus {
            if let Err(e) = notify_generation(bus.as_ref(), generation).await {
                warn!(generation, error = %e, "Failed to publish new generation");
            }
        }
        Ok(generation)
    }

    /// Fetch and store metadata. Returns it with whether it changed.
    async fn refresh_meta(&self, cid: i64) -> Result<(ChangesetMeta, bool)> {
        let meta = self.analyzer.fetch_meta(cid).await?;
        let changed = self.changesets.set_meta(cid, &meta).await?;
        debug!(cid, changed, "Refreshed metadata");
        Ok((meta, changed))
    }

    /// NEW -> BOUNDS_CHECKED, removed, or QUARANTINED.
    ///
    /// Labels come from the pre-label rules applied to fresh metadata. A
    /// changeset whose labels satisfy no pre-filter group is removed.
    pub async fn filter(
        &self,
        attempted: &mut HashSet<i64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>> {
        let request = ClaimRequest::new(ChangesetState::New, ChangesetState::BoundsCheck);
        let Some(guard) = self.claim(request, attempted).await? else {
            return Ok(None);
        };
        let cid = guard.cid();
        let outcome = guard
            .run(shutdown, |record| self.filter_record(record))
            .await?;
        debug!(cid, ?outcome, "Filtered changeset");
        Ok(Some(cid))
    }

    async fn filter_record(&self, record: ChangesetRecord) -> Result<FilterOutcome> {
        let cid = record.cid;
        let meta = match self.analyzer.fetch_meta(cid).await {
            Ok(meta) => meta,
            Err(e) => {
                error!(cid, error = %e, "Failed reading changeset, quarantining");
                self.changesets
                    .processed(cid, &ProcessedUpdate::state(ChangesetState::Quarantined))
                    .await?;
                return Ok(FilterOutcome::Quarantined);
            }
        };

        let labels = self.analyzer.pre_labels(cid, &meta);
        if !self.analyzer.passes_prefilter(&labels) {
            debug!(cid, ?labels, "Changeset failed pre-filter");
            self.changesets.remove(cid).await?;
            return Ok(FilterOutcome::Dropped);
        }

        info!(cid, ?labels, "Changeset passed pre-filter");
        self.changesets.set_meta(cid, &meta).await?;
        self.changesets
            .processed(
                cid,
                &ProcessedUpdate::state(ChangesetState::BoundsChecked).with_labels(labels),
            )
            .await?;

        if let Some(bus) = &self.bus {
            if let Err(e) =
                publish_cset(bus.as_ref(), Topic::AnalysisCset, cid, record.source.clone()).await
            {
                warn!(cid, error = %e, "Failed to publish changeset for analysis");
            }
        }
        Ok(FilterOutcome::Passed)
    }

    /// BOUNDS_CHECKED -> ANALYZING1 -> OPEN | CLOSED.
    pub async fn analyze_initial(
        &self,
        attempted: &mut HashSet<i64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>> {
        let request = ClaimRequest::new(ChangesetState::BoundsChecked, ChangesetState::Analyzing1);
        self.light_step(request, attempted, shutdown).await
    }

    /// OPEN, not refreshed for `refresh_open_minutes` -> ANALYZING1 -> OPEN | CLOSED.
    pub async fn refresh_open(
        &self,
        attempted: &mut HashSet<i64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>> {
        let request = ClaimRequest::new(ChangesetState::Open, ChangesetState::Analyzing1)
            .stale(TimestampColumn::Refreshed, Utc::now() - self.refresh_open);
        self.light_step(request, attempted, shutdown).await
    }

    async fn light_step(
        &self,
        request: ClaimRequest,
        attempted: &mut HashSet<i64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>> {
        let Some(guard) = self.claim(request, attempted).await? else {
            return Ok(None);
        };
        let cid = guard.cid();
        guard
            .run(shutdown, |record| self.light_pass(record, Utc::now()))
            .await?;
        Ok(Some(cid))
    }

    /// Fresh metadata and derived display fields. The light pass always
    /// starts from a new `info`.
    async fn light_pass(&self, record: ChangesetRecord, now: DateTime<Utc>) -> Result<()> {
        let cid = record.cid;
        let (meta, _) = self.refresh_meta(cid).await?;
        let info = ChangesetInfo {
            misc: self.analyzer.local1(&record, &meta, true, now),
            ..Default::default()
        };
        self.changesets.set_info(cid, &info).await?;

        let next = if meta.open {
            ChangesetState::Open
        } else {
            ChangesetState::Closed
        };
        self.changesets
            .processed(cid, &ProcessedUpdate::state(next).refreshed())
            .await?;
        debug!(cid, state = %next, "Light analysis done");
        Ok(())
    }

    /// CLOSED -> ANALYZING2 -> DONE.
    ///
    /// Runs the deep analysis, appends post-analysis labels and bumps the
    /// generation.
    pub async fn analyze_closed(
        &self,
        attempted: &mut HashSet<i64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>> {
        let request = ClaimRequest::new(ChangesetState::Closed, ChangesetState::Analyzing2);
        let Some(guard) = self.claim(request, attempted).await? else {
            return Ok(None);
        };
        let cid = guard.cid();
        guard
            .run(shutdown, |record| self.deep_pass(record))
            .await?;
        Ok(Some(cid))
    }

    async fn deep_pass(&self, record: ChangesetRecord) -> Result<()> {
        let cid = record.cid;
        let now = Utc::now();
        let meta = match &record.meta {
            Some(meta) => meta.clone(),
            None => self.refresh_meta(cid).await?.0,
        };

        let deep = self.analyzer.deep(cid).await?;
        let mut info = deep.info;
        self.analyzer.local2(&record, &meta, &mut info, false, now);

        let mut labels = record.labels.clone();
        for label in self
            .analyzer
            .post_labels(cid, &meta, info.changes.as_deref())
        {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }

        self.changesets.set_info(cid, &info).await?;
        self.changesets
            .processed(
                cid,
                &ProcessedUpdate::state(ChangesetState::Done)
                    .refreshed()
                    .with_labels(labels),
            )
            .await?;
        let generation = self.new_generation().await?;
        info!(cid, generation, truncated = deep.truncated, "Changeset analyzed");
        Ok(())
    }

    /// DONE, not refreshed for `refresh_meta_minutes` -> REANALYZING -> DONE.
    ///
    /// Picks up new discussion comments. The generation only moves when the
    /// stored metadata or info changed.
    pub async fn refresh_done(
        &self,
        attempted: &mut HashSet<i64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>> {
        let request = ClaimRequest::new(ChangesetState::Done, ChangesetState::Reanalyzing)
            .stale(TimestampColumn::Refreshed, Utc::now() - self.refresh_meta);
        let Some(guard) = self.claim(request, attempted).await? else {
            return Ok(None);
        };
        let cid = guard.cid();
        guard
            .run(shutdown, |record| self.reprocess(record, Utc::now()))
            .await?;
        Ok(Some(cid))
    }

    async fn reprocess(&self, record: ChangesetRecord, now: DateTime<Utc>) -> Result<()> {
        let cid = record.cid;
        let (meta, meta_changed) = if self.analyzer.meta_refresh_due(&record, now) {
            self.refresh_meta(cid).await?
        } else {
            let meta = record.meta.clone().ok_or(TrackerError::MissingMeta(cid))?;
            (meta, false)
        };

        let mut info = record.info.clone().unwrap_or_default();
        info.misc = self.analyzer.local1(&record, &meta, meta_changed, now);
        let info_changed = self.changesets.set_info(cid, &info).await?;

        self.changesets
            .processed(cid, &ProcessedUpdate::state(ChangesetState::Done).refreshed())
            .await?;
        if meta_changed || info_changed {
            self.new_generation().await?;
        }
        debug!(cid, meta_changed, info_changed, "Reprocessed changeset");
        Ok(())
    }

    /// Remove every record not updated within the horizon.
    pub async fn evict_horizon(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.horizon;
        let evicted = self.changesets.evict_older_than(cutoff).await?;
        if evicted > 0 {
            info!(evicted, cutoff = %cutoff, "Evicted changesets beyond horizon");
            self.new_generation().await?;
        }
        Ok(evicted)
    }

    /// Return records stuck in a transient state to their source state.
    pub async fn reclaim_stale(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.claim_timeout;
        let reclaimed = self.changesets.reclaim_stale(cutoff).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed changesets stuck in analysis");
        }
        Ok(reclaimed)
    }
}
