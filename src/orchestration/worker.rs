//! Claim loop and bus handlers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::steps::Pipeline;
use super::{ErrorKind, Result, TrackerError};
use crate::bus::{
    BusError, CsetMessage, Envelope, MessageBus, MessageHandler, Result as BusResult, Topic,
};
use crate::utils::bootstrap::sleep_or_shutdown;

/// Which step a loop round runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Filter,
    AnalyzeInitial,
    AnalyzeClosed,
    RefreshOpen,
    RefreshDone,
}

impl Step {
    /// In pipeline order, so a fresh changeset can go all the way in one round.
    pub const ALL: [Step; 5] = [
        Step::Filter,
        Step::AnalyzeInitial,
        Step::AnalyzeClosed,
        Step::RefreshOpen,
        Step::RefreshDone,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Filter => "filter",
            Step::AnalyzeInitial => "analyze_initial",
            Step::AnalyzeClosed => "analyze_closed",
            Step::RefreshOpen => "refresh_open",
            Step::RefreshDone => "refresh_done",
        }
    }

    /// Steps woken by a message on `topic`.
    pub fn for_topic(topic: Topic) -> &'static [Step] {
        match topic {
            Topic::NewCset => &[Step::Filter],
            Topic::AnalysisCset => &[Step::AnalyzeInitial, Step::AnalyzeClosed],
            Topic::RefreshCset => &[Step::RefreshOpen, Step::RefreshDone],
            Topic::NewGeneration | Topic::NewPointer => &[],
        }
    }
}

async fn run_step(
    pipeline: &Pipeline,
    step: Step,
    attempted: &mut HashSet<i64>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<i64>> {
    match step {
        Step::Filter => pipeline.filter(attempted, shutdown).await,
        Step::AnalyzeInitial => pipeline.analyze_initial(attempted, shutdown).await,
        Step::AnalyzeClosed => pipeline.analyze_closed(attempted, shutdown).await,
        Step::RefreshOpen => pipeline.refresh_open(attempted, shutdown).await,
        Step::RefreshDone => pipeline.refresh_done(attempted, shutdown).await,
    }
}

/// Run `step` until nothing is left to claim. Returns the number of
/// changesets the step succeeded on.
///
/// Each changeset is attempted at most once per drain, so a failing one is
/// passed over for the records behind it and a zero refresh interval cannot
/// loop. A failure before anything was claimed ends the drain. Only an
/// interruption is returned as an error.
async fn drain(
    pipeline: &Pipeline,
    step: Step,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<usize> {
    let mut attempted = HashSet::new();
    let mut processed = 0;
    loop {
        if *shutdown.borrow() {
            return Ok(processed);
        }
        let claimed_before = attempted.len();
        match run_step(pipeline, step, &mut attempted, shutdown).await {
            Ok(Some(cid)) => {
                debug!(step = step.name(), cid, "Step done");
                processed += 1;
            }
            Ok(None) => return Ok(processed),
            Err(e) if e.kind() == ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                warn!(step = step.name(), kind = ?e.kind(), error = %e, "Step failed");
                if attempted.len() == claimed_before {
                    return Ok(processed);
                }
            }
        }
    }
}

/// Drives changesets through the pipeline by polling the store.
#[derive(Clone)]
pub struct Worker {
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(pipeline: Arc<Pipeline>, poll_interval: Duration) -> Self {
        Self {
            pipeline,
            poll_interval,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// One round: timeout and horizon sweeps, then every step until idle.
    /// Returns the number of changesets processed.
    pub async fn run_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<usize> {
        if let Err(e) = self.pipeline.reclaim_stale().await {
            error!(error = %e, "Reclaim sweep failed");
        }
        if let Err(e) = self.pipeline.evict_horizon().await {
            error!(error = %e, "Horizon sweep failed");
        }

        let mut processed = 0;
        for step in Step::ALL {
            processed += drain(&self.pipeline, step, shutdown).await?;
        }
        Ok(processed)
    }

    /// Loop until shutdown, sleeping `poll_interval` after idle rounds.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_s = self.poll_interval.as_secs(), "Worker started");
        loop {
            let processed = match self.run_once(&mut shutdown).await {
                Ok(n) => n,
                Err(e) => {
                    info!(error = %e, "Worker interrupted");
                    break;
                }
            };
            if processed > 0 {
                debug!(processed, "Worker round done");
                continue;
            }
            if sleep_or_shutdown(self.poll_interval, &mut shutdown).await {
                break;
            }
        }
        info!("Worker stopped");
    }

    /// Run the loop in a background task.
    pub fn spawn(self) -> WorkerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(cancel_rx).await });
        WorkerHandle {
            cancel: cancel_tx,
            task,
        }
    }

    /// Subscribe to the work topics so messages trigger their steps right
    /// away instead of on the next poll.
    pub async fn subscribe(&self, bus: &dyn MessageBus, shutdown: watch::Receiver<bool>) -> BusResult<()> {
        for topic in [Topic::NewCset, Topic::AnalysisCset, Topic::RefreshCset] {
            let handler = StepHandler {
                pipeline: self.pipeline.clone(),
                steps: Step::for_topic(topic),
                shutdown: shutdown.clone(),
            };
            bus.subscribe(topic, Box::new(handler)).await?;
            debug!(topic = %topic, "Subscribed");
        }
        Ok(())
    }
}

/// Handle to a running worker task.
pub struct WorkerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop. A claimed changeset is rolled back.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker task panicked");
        }
    }
}

/// Runs the steps of a work topic for each delivered message.
///
/// Completes, and so lets the message be acknowledged, only after the steps
/// have stored their results.
struct StepHandler {
    pipeline: Arc<Pipeline>,
    steps: &'static [Step],
    shutdown: watch::Receiver<bool>,
}

impl MessageHandler for StepHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, BusResult<()>> {
        let pipeline = self.pipeline.clone();
        let steps = self.steps;
        let mut shutdown = self.shutdown.clone();
        Box::pin(async move {
            let message: CsetMessage = envelope.decode()?;
            debug!(cid = message.cid, schema = %envelope.schema, "Work message received");
            for step in steps {
                drain(&pipeline, *step, &mut shutdown)
                    .await
                    .map_err(|e: TrackerError| BusError::Handler(e.to_string()))?;
            }
            Ok(())
        })
    }
}
