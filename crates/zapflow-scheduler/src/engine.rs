//! Scheduler engine — the polling loop that claims due follow-ups, dispatches
//! them and writes the outcome back.
//!
//! Each worker runs one loop. Workers never coordinate directly: the atomic
//! claim in the job store is the only thing keeping two of them off the same
//! job. Jobs in a batch are processed one after another, oldest first.
//!
//! ```text
//! tick ──► claim_due(limit, stale_window)
//!            └─ for each job: guard ─► dispatch ─┬─ SENT   ─► mark_sent
//!                                                ├─ QUEUED ─► reschedule(cooldown | best time | backoff)
//!                                                └─ error  ─► attempts >= max ? mark_failed : reschedule(backoff)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use zapflow_core::config::SchedulerConfig;
use zapflow_core::{FollowUp, Result, ZapflowError};

use crate::backoff::BackoffPolicy;
use crate::best_time::queued_delay_minutes;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::store::{ClaimedJob, DispatchMeta, JobStore};

/// Time source. Swappable so tests can move the clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Resolved loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub startup_delay: Duration,
    pub batch_limit: usize,
    pub stale_window: Duration,
    pub backoff: BackoffPolicy,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            worker_id: config.resolved_worker_id(),
            poll_interval: config.poll_interval(),
            startup_delay: config.startup_delay(),
            batch_limit: config.batch_limit,
            stale_window: config.stale_window(),
            backoff: BackoffPolicy::new(config.backoff_base_minutes),
        }
    }
}

/// How one claimed job ended this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    /// Deferred by the transport, back in the queue.
    Queued { delay_minutes: u64 },
    /// Dispatch failed, retry scheduled.
    Retried { delay_minutes: u64 },
    /// Out of attempts.
    Failed,
    /// Lease no longer ours.
    Skipped,
    /// Could not record any outcome; the lease will go stale and be reclaimed.
    Errored,
}

/// Per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub sent: usize,
    pub queued: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl TickReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Sent => self.sent += 1,
            JobOutcome::Queued { .. } => self.queued += 1,
            JobOutcome::Retried { .. } => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Errored => self.errored += 1,
        }
    }
}

/// The follow-up scheduler.
pub struct SchedulerEngine {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    settings: SchedulerSettings,
    clock: Clock,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Claim and process one batch.
    ///
    /// Claim errors are returned; per-job errors are absorbed into the report.
    pub async fn tick(&self) -> Result<TickReport> {
        let claimed = self
            .store
            .claim_due(
                &self.settings.worker_id,
                self.settings.batch_limit,
                self.settings.stale_window,
                self.now(),
            )
            .await?;

        let mut report = TickReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        for job in claimed {
            report.record(self.process(job).await);
        }
        Ok(report)
    }

    /// Process one claimed job. Never fails: any error while dispatching or
    /// recording falls back to the retry-or-fail decision. A write-back refused
    /// because another worker reclaimed the job counts as skipped.
    pub async fn process(&self, claimed: ClaimedJob) -> JobOutcome {
        match self.try_process(&claimed).await {
            Ok(outcome) => outcome,
            Err(ZapflowError::LeaseLost(e)) => {
                tracing::info!(follow_up = %claimed.job.id, "⏭️ Lease lost before write-back: {e}");
                JobOutcome::Skipped
            }
            Err(e) => {
                tracing::warn!(follow_up = %claimed.job.id, "⚠️ Processing error: {e}");
                match self.retry_or_fail(&claimed.job, e.to_string()).await {
                    Ok(outcome) => outcome,
                    Err(ZapflowError::LeaseLost(e)) => {
                        tracing::info!(follow_up = %claimed.job.id, "⏭️ Lease lost before write-back: {e}");
                        JobOutcome::Skipped
                    }
                    Err(e) => {
                        tracing::error!(
                            follow_up = %claimed.job.id,
                            "❌ Could not record outcome, lease left to expire: {e}"
                        );
                        JobOutcome::Errored
                    }
                }
            }
        }
    }

    async fn try_process(&self, claimed: &ClaimedJob) -> Result<JobOutcome> {
        let job = &claimed.job;
        let worker_id = &self.settings.worker_id;

        match self.store.get(&job.id).await? {
            Some(current) if current.is_leased_by(worker_id) => {}
            Some(current) if current.is_terminal() => {
                tracing::info!(
                    follow_up = %job.id,
                    status = %current.status,
                    "⏭️ Already finished, skipping"
                );
                return Ok(JobOutcome::Skipped);
            }
            current => {
                tracing::info!(
                    follow_up = %job.id,
                    status = ?current.map(|j| j.status),
                    "⏭️ Lease lost, skipping"
                );
                return Ok(JobOutcome::Skipped);
            }
        }

        match self.dispatcher.dispatch(claimed, worker_id).await {
            Ok(DispatchOutcome::Sent { variant }) => {
                self.store
                    .mark_sent(&job.id, worker_id, &DispatchMeta { variant }, self.now())
                    .await?;
                tracing::info!(follow_up = %job.id, lead = %job.lead_id, "✅ Follow-up sent");
                Ok(JobOutcome::Sent)
            }
            Ok(DispatchOutcome::Queued { .. }) => {
                let delay_minutes =
                    queued_delay_minutes(job, &self.settings.backoff, &mut rand::thread_rng());
                self.store
                    .reschedule(
                        &job.id,
                        worker_id,
                        delay_minutes,
                        job.last_error.clone(),
                        self.now(),
                    )
                    .await?;
                tracing::info!(
                    follow_up = %job.id,
                    delay_minutes,
                    "🕒 Transport deferred send, rescheduled"
                );
                Ok(JobOutcome::Queued { delay_minutes })
            }
            Err(e) => {
                tracing::warn!(follow_up = %job.id, attempt = job.attempts, "⚠️ Dispatch failed: {e}");
                self.retry_or_fail(job, e.to_string()).await
            }
        }
    }

    /// Reschedule with backoff, or fail for good once attempts are exhausted.
    async fn retry_or_fail(&self, job: &FollowUp, error: String) -> Result<JobOutcome> {
        if job.attempts >= job.max_attempts {
            self.store
                .mark_failed(&job.id, &self.settings.worker_id, &error, self.now())
                .await?;
            tracing::warn!(
                follow_up = %job.id,
                attempts = job.attempts,
                "❌ Follow-up failed permanently: {error}"
            );
            return Ok(JobOutcome::Failed);
        }

        let delay_minutes = self
            .settings
            .backoff
            .delay_minutes(job.attempts.saturating_sub(1));
        self.store
            .reschedule(
                &job.id,
                &self.settings.worker_id,
                delay_minutes,
                Some(error),
                self.now(),
            )
            .await?;
        tracing::info!(follow_up = %job.id, delay_minutes, "🔁 Retry scheduled");
        Ok(JobOutcome::Retried { delay_minutes })
    }

    /// Run the polling loop until `shutdown` flips to true (or its sender is
    /// dropped). A failing tick is logged and the loop carries on.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Follow-up scheduler started (worker={}, every {}s, batch {}, backoff {}..{} min)",
            self.settings.worker_id,
            self.settings.poll_interval.as_secs(),
            self.settings.batch_limit,
            self.settings.backoff.delay_minutes(0),
            self.settings.backoff.max_delay_minutes()
        );

        // Staggered start so workers booting together don't race the first claim.
        tokio::select! {
            _ = tokio::time::sleep(self.settings.startup_delay) => {}
            _ = shutdown.changed() => {
                tracing::info!("🛑 Follow-up scheduler stopped before first tick");
                return;
            }
        }

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) if report.claimed > 0 => tracing::info!(
                    "📣 Tick: claimed={} sent={} queued={} retried={} failed={} skipped={} errored={}",
                    report.claimed,
                    report.sent,
                    report.queued,
                    report.retried,
                    report.failed,
                    report.skipped,
                    report.errored
                ),
                Ok(_) => tracing::debug!("Tick: nothing due"),
                Err(e) => tracing::warn!("⚠️ Tick failed, retrying next interval: {e}"),
            }
        }

        tracing::info!("🛑 Follow-up scheduler stopped");
    }

    /// Spawn the loop as a background tokio task.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        SchedulerHandle { shutdown: tx, join }
    }
}

/// Handle to a spawned scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop claiming new work and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!("Scheduler task ended abnormally: {e}");
        }
    }
}
