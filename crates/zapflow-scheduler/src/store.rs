//! Job store port — the only gateway to durable follow-up state.
//!
//! Every mutation of a follow-up goes through one of these operations; the
//! scheduler never reads a status and writes it back on its own. `claim_due`
//! is the correctness-critical operation: selection and lease stamping happen
//! in one atomic step so two workers never claim the same job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zapflow_core::{FollowUp, FollowUpStatus, Lead, NewFollowUp, Result, StatusCounts};

/// A job leased to the caller, together with its recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: FollowUp,
    pub lead: Lead,
}

/// Transport details recorded when a follow-up is delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchMeta {
    /// A/B variant chosen by the transport.
    pub variant: Option<String>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Lease up to `limit` due jobs to `worker_id`, oldest `scheduled_at` first.
    ///
    /// Eligible: `scheduled` jobs that are due, and `processing` jobs whose
    /// lease is older than `stale_window`. Leads that opted out are skipped.
    /// Claimed jobs come back as `processing` with `attempts` incremented.
    async fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        stale_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>>;

    /// Put a job back in the queue `delay_minutes` from `now`, clearing its lease.
    ///
    /// This and the other write-backs only apply while `worker_id` still holds
    /// the lease; otherwise they fail with `LeaseLost` and change nothing.
    async fn reschedule(
        &self,
        id: &str,
        worker_id: &str,
        delay_minutes: u64,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Terminal success. Also bumps the lead's outbound-contact counters.
    async fn mark_sent(
        &self,
        id: &str,
        worker_id: &str,
        meta: &DispatchMeta,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Terminal failure.
    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<FollowUp>>;

    /// Insert a new `scheduled` job for an existing lead.
    async fn enqueue(&self, new: NewFollowUp, now: DateTime<Utc>) -> Result<FollowUp>;

    /// Most recent jobs, optionally filtered by status.
    async fn list(&self, status: Option<FollowUpStatus>, limit: usize) -> Result<Vec<FollowUp>>;

    async fn upsert_lead(&self, lead: &Lead) -> Result<()>;

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>>;

    async fn set_opt_out(&self, lead_id: &str, opted_out: bool) -> Result<()>;

    async fn stats(&self) -> Result<StatusCounts>;
}
