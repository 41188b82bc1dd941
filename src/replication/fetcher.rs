//! Replication pointer advancement and the tracking loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::ReplicationClient;
use super::state::ReplicationState;
use super::Result;
use crate::bus::{notify_pointer, publish_cset, MessageBus, Topic};
use crate::config::TrackerConfig;
use crate::model::{BBox, FeedType, PointerPosition, ReplicationPointer, Source};
use crate::storage::{ChangesetStore, ContextStore};
use crate::utils::bootstrap::sleep_or_shutdown;

/// Sequence number recorded for simulated observations.
pub const SIMULATED_SEQNO: u64 = 123_456_789;

/// Nominal wall-clock spacing of minute diffs.
const CATCH_UP_PERIOD: Duration = Duration::from_secs(60);

/// A changeset seen on the feed, with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub cid: i64,
    pub source: Source,
}

impl Observation {
    /// Bounding box, only known for the changesets feed.
    pub fn bbox(&self) -> Option<BBox> {
        self.source.bbox
    }
}

/// Outcome of one `advance` call.
#[derive(Debug, Clone)]
pub struct Advance {
    /// Pointer after this step. Equal to the input when nothing was consumed.
    pub pointer: PointerPosition,
    pub changesets: Vec<Observation>,
    pub head: ReplicationState,
}

impl Advance {
    /// True once the pointer has moved past the head sequence number.
    pub fn is_caught_up(&self) -> bool {
        self.pointer.seqno > self.head.seqno
    }
}

/// Replication feed fetcher for one feed type.
#[derive(Clone)]
pub struct Fetcher {
    client: ReplicationClient,
    feed: FeedType,
    retry_delay: Duration,
}

impl Fetcher {
    pub fn new(client: ReplicationClient, feed: FeedType, retry_delay: Duration) -> Self {
        Self {
            client,
            feed,
            retry_delay,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(
            ReplicationClient::from_config(config),
            config.feed_type,
            Duration::from_secs(config.fetch_retry_delay_secs),
        )
    }

    pub fn feed(&self) -> FeedType {
        self.feed
    }

    /// Most recent state of the feed.
    pub async fn head(&self) -> Result<ReplicationState> {
        self.client.state(self.feed, None).await
    }

    /// Consume the diff at `pointer` if it is not ahead of the head state.
    ///
    /// The returned pointer names the next sequence number to consume and
    /// carries the timestamp of the consumed one. Any failure leaves the
    /// caller's pointer untouched.
    pub async fn advance(&self, pointer: &PointerPosition) -> Result<Advance> {
        let head = self.head().await?;
        if pointer.seqno > head.seqno {
            debug!(seqno = pointer.seqno, head = head.seqno, "Pointer ahead of head");
            return Ok(Advance {
                pointer: pointer.clone(),
                changesets: Vec::new(),
                head,
            });
        }

        debug!(seqno = pointer.seqno, head = head.seqno, "Fetching diff");
        let found = self.client.diff_changesets(self.feed, pointer.seqno).await?;

        // The next sequence number may not exist yet, so the pointer keeps
        // the timestamp of the one just consumed.
        let consumed = if pointer.seqno == head.seqno {
            head.clone()
        } else {
            self.client.state(self.feed, Some(pointer.seqno)).await?
        };

        let observed = Utc::now();
        let changesets = found
            .into_iter()
            .map(|cset| Observation {
                cid: cset.cid,
                source: Source {
                    feed: self.feed,
                    sequenceno: pointer.seqno,
                    observed,
                    bbox: cset.bbox,
                },
            })
            .collect();

        Ok(Advance {
            pointer: PointerPosition {
                stype: self.feed,
                seqno: pointer.seqno + 1,
                timestamp: consumed.timestamp,
            },
            changesets,
            head,
        })
    }

    /// Pointer one step behind head, used to start tracking from "now".
    pub async fn initial_pointer(&self) -> Result<PointerPosition> {
        let head = self.head().await?;
        Ok(PointerPosition {
            stype: self.feed,
            seqno: head.seqno.saturating_sub(1),
            timestamp: head.timestamp,
        })
    }

    /// Search backward from `start` for the newest state whose timestamp is
    /// at or before `target`.
    ///
    /// On the minute feed a first jump estimates the distance from the
    /// elapsed wall-clock time. `max_iter` bounds the linear walk; `None`
    /// walks down to sequence number 0.
    pub async fn locate(
        &self,
        target: DateTime<Utc>,
        start: &ReplicationState,
        max_iter: Option<u64>,
    ) -> Result<Option<ReplicationState>> {
        let mut ptr = start.clone();
        let mut seqno = ptr.seqno;

        if self.feed == FeedType::Minute {
            let now = Utc::now();
            let secs = (now - target).num_seconds();
            if secs > 10 {
                let skip = (secs / 60) as u64;
                seqno = seqno.saturating_sub(skip);
                ptr = self.client.state(self.feed, Some(seqno)).await?;
                debug!(skip, seqno, timestamp = %ptr.timestamp, "Skipped back");
            }
        }

        let stop = max_iter.map(|n| seqno.saturating_sub(n));
        while ptr.timestamp > target && Some(ptr.seqno) != stop && seqno > 0 {
            seqno -= 1;
            ptr = self.client.state(self.feed, Some(seqno)).await?;
        }

        if ptr.timestamp > target {
            return Ok(None);
        }
        Ok(Some(ptr))
    }

    /// Record a synthetic observation of `cid`, bypassing the feed.
    pub async fn simulate(&self, store: &dyn ChangesetStore, cid: i64) -> Result<Observation> {
        let observation = Observation {
            cid,
            source: Source {
                feed: self.feed,
                sequenceno: SIMULATED_SEQNO,
                observed: Utc::now(),
                bbox: None,
            },
        };
        store.append(cid, Some(observation.source.clone())).await?;
        info!(cid, "Simulated changeset observation");
        Ok(observation)
    }

    /// Initialize the stored pointer if there is none.
    pub async fn ensure_pointer(&self, context: &dyn ContextStore) -> Result<ReplicationPointer> {
        if let Some(pointer) = context.pointer().await? {
            return Ok(pointer);
        }
        let position = self.initial_pointer().await?;
        let pointer = context.set_pointer(&position).await?;
        info!(seqno = pointer.seqno, feed = %self.feed, "Initialized pointer");
        Ok(pointer)
    }

    /// Store observations and move the persisted pointer.
    async fn persist(
        &self,
        advance: &Advance,
        from: &ReplicationPointer,
        changesets: &dyn ChangesetStore,
        context: &dyn ContextStore,
        bus: Option<&dyn MessageBus>,
    ) -> Result<()> {
        for observation in &advance.changesets {
            changesets
                .append(observation.cid, Some(observation.source.clone()))
                .await?;
            if let Some(bus) = bus {
                if let Err(e) = publish_cset(
                    bus,
                    Topic::NewCset,
                    observation.cid,
                    Some(observation.source.clone()),
                )
                .await
                {
                    warn!(cid = observation.cid, error = %e, "Failed to publish new changeset");
                }
            }
        }

        context
            .pointer_update_timestamp(advance.pointer.timestamp)
            .await?;
        let pointer = context
            .pointer_advance(advance.pointer.seqno as i64 - from.seqno as i64)
            .await?;

        info!(
            seqno = from.seqno,
            changesets = advance.changesets.len(),
            head = advance.head.seqno,
            "Consumed diff"
        );

        if let Some(bus) = bus {
            if let Err(e) = notify_pointer(bus, &pointer.position()).await {
                warn!(error = %e, "Failed to publish new pointer");
            }
        }
        Ok(())
    }

    /// Follow the feed until `shutdown` is signalled.
    ///
    /// Diffs are consumed back to back while behind head. Once caught up the
    /// loop waits for the remainder of the nominal diff period. Errors never
    /// move the pointer; the loop waits the retry delay and tries again.
    pub async fn track(
        &self,
        changesets: Arc<dyn ChangesetStore>,
        context: Arc<dyn ContextStore>,
        bus: Option<Arc<dyn MessageBus>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.ensure_pointer(context.as_ref()).await?;
        info!(feed = %self.feed, "Tracking replication feed");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let delay = match self.step(changesets.as_ref(), context.as_ref(), bus.as_deref()).await {
                Ok(Some(advance)) if !advance.is_caught_up() => continue,
                Ok(Some(_)) => CATCH_UP_PERIOD.saturating_sub(started.elapsed()),
                Ok(None) => CATCH_UP_PERIOD,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, delay_s = self.retry_delay.as_secs(), "Error retrieving OSM data");
                    self.retry_delay
                }
                Err(e) => {
                    error!(error = %e, delay_s = self.retry_delay.as_secs(), "Fetch step failed");
                    self.retry_delay
                }
            };

            debug!(delay_ms = delay.as_millis() as u64, "Fetcher sleeping");
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        info!("Fetcher stopped");
        Ok(())
    }

    /// One advance-and-persist round. `None` if nothing was consumed.
    async fn step(
        &self,
        changesets: &dyn ChangesetStore,
        context: &dyn ContextStore,
        bus: Option<&dyn MessageBus>,
    ) -> Result<Option<Advance>> {
        let pointer = self.ensure_pointer(context).await?;
        let advance = self.advance(&pointer.position()).await?;
        if advance.pointer.seqno == pointer.seqno {
            return Ok(None);
        }
        self.persist(&advance, &pointer, changesets, context, bus)
            .await?;
        Ok(Some(advance))
    }

    /// Run `track` in a background task.
    pub fn spawn(
        self,
        changesets: Arc<dyn ChangesetStore>,
        context: Arc<dyn ContextStore>,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> FetcherHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = self.track(changesets, context, bus, cancel_rx).await {
                error!(error = %e, "Fetcher terminated");
            }
        });
        FetcherHandle {
            cancel: cancel_tx,
            task,
        }
    }
}

/// Handle to a running fetcher task.
pub struct FetcherHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FetcherHandle {
    /// Signal the fetcher to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Fetcher task panicked");
        }
    }
}
