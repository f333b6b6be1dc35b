//! SQLite-backed job store — survives restarts, safe to share between
//! worker processes pointed at the same database file.
//!
//! Claims run inside a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock before the due-job SELECT, so the select-then-stamp
//! sequence is atomic across connections and processes.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use zapflow_core::types::DEFAULT_MAX_ATTEMPTS;
use zapflow_core::{
    FollowUp, FollowUpStatus, JsonPayload, Lead, NewFollowUp, Result, StatusCounts, ZapflowError,
    epoch_ms,
};

use crate::store::{ClaimedJob, DispatchMeta, JobStore};

const FOLLOW_UP_COLUMNS: &str = "f.id, f.lead_id, f.status, f.scheduled_at, f.processing_at, \
     f.worker_id, f.attempts, f.max_attempts, f.last_error, f.objective, f.constraints_json, \
     f.cta_json, f.ab_test, f.template_id, f.idempotency_key, f.command_id, f.created_at, \
     f.sent_at, f.variant";

const LEAD_COLUMNS: &str =
    "l.id, l.wa_jid, l.name, l.opted_out, l.outbound_count, l.last_outbound_at";

/// `last_error` for a job whose final lease went stale.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired after final attempt";

/// Number of columns in [`FOLLOW_UP_COLUMNS`]; lead columns follow at this offset.
const FOLLOW_UP_WIDTH: usize = 19;

/// SQLite job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err("DB open"))?;
        conn.busy_timeout(busy_timeout)
            .map_err(store_err("busy timeout"))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(store_err("journal mode"))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (one connection, not shareable).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| ZapflowError::Store("sqlite connection lock poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ZapflowError::Store(format!("store task failed: {e}")))?
    }
}

/// Create tables and indexes.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            wa_jid TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            opted_out INTEGER NOT NULL DEFAULT 0,
            outbound_count INTEGER NOT NULL DEFAULT 0,
            last_outbound_at INTEGER             -- epoch ms
        );

        CREATE TABLE IF NOT EXISTS follow_ups (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL REFERENCES leads(id),
            status TEXT NOT NULL DEFAULT 'scheduled',  -- scheduled, processing, sent, failed
            scheduled_at INTEGER,                -- epoch ms, NULL = as soon as possible
            processing_at INTEGER,               -- lease start, epoch ms
            worker_id TEXT,                      -- lease holder
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            objective TEXT NOT NULL,
            constraints_json TEXT,
            cta_json TEXT,
            ab_test INTEGER NOT NULL DEFAULT 0,
            template_id TEXT,
            idempotency_key TEXT,
            command_id TEXT,
            created_at INTEGER NOT NULL,
            sent_at INTEGER,
            variant TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_follow_ups_due ON follow_ups(status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_follow_ups_lead ON follow_ups(lead_id);
        ",
    )
    .map_err(store_err("Migration"))?;
    Ok(())
}

fn store_err(ctx: &'static str) -> impl Fn(rusqlite::Error) -> ZapflowError {
    move |e| ZapflowError::Store(format!("{ctx}: {e}"))
}

fn conversion_err(idx: usize, e: ZapflowError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn read_payload(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<JsonPayload>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| JsonPayload::parse(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn read_follow_up(row: &Row<'_>) -> rusqlite::Result<FollowUp> {
    let status: String = row.get(2)?;
    Ok(FollowUp {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        status: FollowUpStatus::parse(&status).map_err(|e| conversion_err(2, e))?,
        scheduled_at: row.get(3)?,
        processing_at: row.get(4)?,
        worker_id: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error: row.get(8)?,
        objective: row.get(9)?,
        constraints: read_payload(row, 10)?,
        cta: read_payload(row, 11)?,
        ab_test: row.get(12)?,
        template_id: row.get(13)?,
        idempotency_key: row.get(14)?,
        command_id: row.get(15)?,
        created_at: row.get(16)?,
        sent_at: row.get(17)?,
        variant: row.get(18)?,
    })
}

fn read_lead(row: &Row<'_>, offset: usize) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(offset)?,
        wa_jid: row.get(offset + 1)?,
        name: row.get(offset + 2)?,
        opted_out: row.get(offset + 3)?,
        outbound_count: row.get(offset + 4)?,
        last_outbound_at: row.get(offset + 5)?,
    })
}

/// Run a single-row lease-guarded UPDATE. No row changed means either the job
/// does not exist (`NotFound`) or someone else holds it now (`LeaseLost`).
fn update_leased(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    id: &str,
    worker_id: &str,
) -> Result<()> {
    let changed = conn.execute(sql, params).map_err(store_err("Update follow-up"))?;
    if changed > 0 {
        return Ok(());
    }
    let exists = conn
        .query_row("SELECT 1 FROM follow_ups WHERE id = ?1", [id], |_| Ok(()))
        .optional()
        .map_err(store_err("Lookup follow-up"))?
        .is_some();
    if exists {
        Err(ZapflowError::LeaseLost(format!("follow-up {id} not leased by {worker_id}")))
    } else {
        Err(ZapflowError::NotFound(format!("follow-up {id}")))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        stale_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let worker_id = worker_id.to_string();
        let now_ms = epoch_ms(now);
        let stale_before = now_ms - stale_window.as_millis() as i64;

        self.run(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(store_err("Begin claim"))?;

            // A stale lease on the last allowed attempt is a failure, not a retry.
            let expired = tx
                .execute(
                    "UPDATE follow_ups
                     SET status = 'failed', processing_at = NULL, worker_id = NULL,
                         last_error = ?1
                     WHERE status = 'processing'
                       AND (processing_at IS NULL OR processing_at < ?2)
                       AND attempts >= max_attempts",
                    params![LEASE_EXPIRED_ERROR, stale_before],
                )
                .map_err(store_err("Expire exhausted leases"))?;
            if expired > 0 {
                tracing::warn!(count = expired, "❌ Stale leases on final attempt marked failed");
            }

            let ids: Vec<String> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT f.id FROM follow_ups f
                         JOIN leads l ON l.id = f.lead_id
                         WHERE l.opted_out = 0
                           AND (
                             (f.status = 'scheduled'
                                AND (f.scheduled_at IS NULL OR f.scheduled_at <= ?1))
                             OR (f.status = 'processing'
                                AND (f.processing_at IS NULL OR f.processing_at < ?2))
                           )
                         ORDER BY f.scheduled_at ASC, f.created_at ASC, f.id ASC
                         LIMIT ?3",
                    )
                    .map_err(store_err("Prepare claim"))?;
                let rows = stmt
                    .query_map(params![now_ms, stale_before, limit as i64], |row| row.get(0))
                    .map_err(store_err("Select due"))?;
                rows.collect::<rusqlite::Result<_>>()
                    .map_err(store_err("Select due"))?
            };

            let mut claimed = Vec::with_capacity(ids.len());
            {
                let sql = format!(
                    "SELECT {FOLLOW_UP_COLUMNS}, {LEAD_COLUMNS} FROM follow_ups f
                     JOIN leads l ON l.id = f.lead_id WHERE f.id = ?1"
                );
                let mut load = tx.prepare(&sql).map_err(store_err("Prepare load"))?;
                for id in &ids {
                    tx.execute(
                        "UPDATE follow_ups
                         SET status = 'processing', processing_at = ?1, worker_id = ?2,
                             attempts = attempts + 1
                         WHERE id = ?3",
                        params![now_ms, worker_id, id],
                    )
                    .map_err(store_err("Claim follow-up"))?;

                    let job = load
                        .query_row([id], |row| {
                            Ok(ClaimedJob {
                                job: read_follow_up(row)?,
                                lead: read_lead(row, FOLLOW_UP_WIDTH)?,
                            })
                        })
                        .map_err(store_err("Load claimed follow-up"))?;
                    claimed.push(job);
                }
            }

            tx.commit().map_err(store_err("Commit claim"))?;
            Ok(claimed)
        })
        .await
    }

    async fn reschedule(
        &self,
        id: &str,
        worker_id: &str,
        delay_minutes: u64,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        let delay_ms = i64::try_from(delay_minutes.saturating_mul(60_000)).unwrap_or(i64::MAX);
        let next = epoch_ms(now).saturating_add(delay_ms);
        self.run(move |conn| {
            update_leased(
                conn,
                "UPDATE follow_ups
                 SET status = 'scheduled', processing_at = NULL, worker_id = NULL,
                     scheduled_at = ?1, last_error = ?2
                 WHERE id = ?3 AND status = 'processing' AND worker_id = ?4",
                params![next, last_error, id, worker_id],
                &id,
                &worker_id,
            )
        })
        .await
    }

    async fn mark_sent(
        &self,
        id: &str,
        worker_id: &str,
        meta: &DispatchMeta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        let variant = meta.variant.clone();
        let now_ms = epoch_ms(now);
        self.run(move |conn| {
            let tx = conn.transaction().map_err(store_err("Begin mark sent"))?;
            update_leased(
                &tx,
                "UPDATE follow_ups
                 SET status = 'sent', sent_at = ?1, last_error = NULL,
                     processing_at = NULL, worker_id = NULL, variant = ?2
                 WHERE id = ?3 AND status = 'processing' AND worker_id = ?4",
                params![now_ms, variant, id, worker_id],
                &id,
                &worker_id,
            )?;
            tx.execute(
                "UPDATE leads
                 SET outbound_count = outbound_count + 1, last_outbound_at = ?1
                 WHERE id = (SELECT lead_id FROM follow_ups WHERE id = ?2)",
                params![now_ms, id],
            )
            .map_err(store_err("Update lead counters"))?;
            tx.commit().map_err(store_err("Commit mark sent"))?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        self.run(move |conn| {
            update_leased(
                conn,
                "UPDATE follow_ups
                 SET status = 'failed', processing_at = NULL, worker_id = NULL, last_error = ?1
                 WHERE id = ?2 AND status = 'processing' AND worker_id = ?3",
                params![error, id, worker_id],
                &id,
                &worker_id,
            )
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<FollowUp>> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups f WHERE f.id = ?1"),
                [id],
                read_follow_up,
            )
            .optional()
            .map_err(store_err("Load follow-up"))
        })
        .await
    }

    async fn enqueue(&self, new: NewFollowUp, now: DateTime<Utc>) -> Result<FollowUp> {
        let job = FollowUp {
            id: uuid::Uuid::new_v4().to_string(),
            lead_id: new.lead_id,
            status: FollowUpStatus::Scheduled,
            scheduled_at: new.scheduled_at,
            processing_at: None,
            worker_id: None,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            last_error: None,
            objective: new.objective,
            constraints: new.constraints,
            cta: new.cta,
            ab_test: new.ab_test,
            template_id: new.template_id,
            idempotency_key: new.idempotency_key,
            command_id: new.command_id,
            created_at: epoch_ms(now),
            sent_at: None,
            variant: None,
        };

        self.run(move |conn| {
            let lead_exists = conn
                .query_row("SELECT 1 FROM leads WHERE id = ?1", [&job.lead_id], |_| Ok(()))
                .optional()
                .map_err(store_err("Lookup lead"))?
                .is_some();
            if !lead_exists {
                return Err(ZapflowError::NotFound(format!("lead {}", job.lead_id)));
            }

            conn.execute(
                "INSERT INTO follow_ups
                 (id, lead_id, status, scheduled_at, attempts, max_attempts, objective,
                  constraints_json, cta_json, ab_test, template_id, idempotency_key,
                  command_id, created_at)
                 VALUES (?1, ?2, 'scheduled', ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.id,
                    job.lead_id,
                    job.scheduled_at,
                    job.max_attempts,
                    job.objective,
                    job.constraints.as_ref().map(JsonPayload::to_json_string),
                    job.cta.as_ref().map(JsonPayload::to_json_string),
                    job.ab_test,
                    job.template_id,
                    job.idempotency_key,
                    job.command_id,
                    job.created_at,
                ],
            )
            .map_err(store_err("Insert follow-up"))?;
            Ok(job)
        })
        .await
    }

    async fn list(&self, status: Option<FollowUpStatus>, limit: usize) -> Result<Vec<FollowUp>> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups f
                 WHERE (?1 IS NULL OR f.status = ?1)
                 ORDER BY f.created_at DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql).map_err(store_err("Prepare list"))?;
            let rows = stmt
                .query_map(
                    params![status.map(|s| s.as_str()), limit as i64],
                    read_follow_up,
                )
                .map_err(store_err("List follow-ups"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err("List follow-ups"))
        })
        .await
    }

    async fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        let lead = lead.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO leads (id, wa_jid, name, opted_out, outbound_count, last_outbound_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     wa_jid = excluded.wa_jid, name = excluded.name, opted_out = excluded.opted_out",
                params![
                    lead.id,
                    lead.wa_jid,
                    lead.name,
                    lead.opted_out,
                    lead.outbound_count,
                    lead.last_outbound_at,
                ],
            )
            .map_err(store_err("Upsert lead"))?;
            Ok(())
        })
        .await
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads l WHERE l.id = ?1"),
                [id],
                |row| read_lead(row, 0),
            )
            .optional()
            .map_err(store_err("Load lead"))
        })
        .await
    }

    async fn set_opt_out(&self, lead_id: &str, opted_out: bool) -> Result<()> {
        let lead_id = lead_id.to_string();
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE leads SET opted_out = ?1 WHERE id = ?2",
                    params![opted_out, lead_id],
                )
                .map_err(store_err("Set opt-out"))?;
            if changed == 0 {
                return Err(ZapflowError::NotFound(format!("lead {lead_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> Result<StatusCounts> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM follow_ups GROUP BY status")
                .map_err(store_err("Prepare stats"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(store_err("Stats"))?;
            let mut counts = StatusCounts::default();
            for row in rows {
                let (status, n) = row.map_err(store_err("Stats"))?;
                let n = n.max(0) as u64;
                match FollowUpStatus::parse(&status)? {
                    FollowUpStatus::Scheduled => counts.scheduled = n,
                    FollowUpStatus::Processing => counts.processing = n,
                    FollowUpStatus::Sent => counts.sent = n,
                    FollowUpStatus::Failed => counts.failed = n,
                }
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::path::PathBuf;

    const STALE: Duration = Duration::from_secs(600);

    fn temp_db(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("zapflow-store-test-{}", uuid::Uuid::new_v4()))
            .join(format!("{name}.db"))
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    async fn seeded() -> SqliteJobStore {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.upsert_lead(&Lead::new("l1", "5511@s.whatsapp.net", "Ana")).await.unwrap();
        store
    }

    fn ago(now: DateTime<Utc>, ms: i64) -> i64 {
        epoch_ms(now) - ms
    }

    #[tokio::test]
    async fn test_enqueue_requires_lead() {
        let store = seeded().await;
        let err = store
            .enqueue(NewFollowUp::new("missing", "reengage"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ZapflowError::NotFound(_)));

        let job = store.enqueue(NewFollowUp::new("l1", "reengage"), Utc::now()).await.unwrap();
        assert_eq!(job.status, FollowUpStatus::Scheduled);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(store.get(&job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_claim_stamps_lease() {
        let store = seeded().await;
        let now = Utc::now();
        let job = store
            .enqueue(NewFollowUp::new("l1", "reengage").at(ago(now, 1_000)), now)
            .await
            .unwrap();

        let claimed = store.claim_due("w1", 10, STALE, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let c = &claimed[0];
        assert_eq!(c.job.id, job.id);
        assert_eq!(c.job.status, FollowUpStatus::Processing);
        assert_eq!(c.job.processing_at, Some(epoch_ms(now)));
        assert_eq!(c.job.worker_id.as_deref(), Some("w1"));
        assert_eq!(c.job.attempts, 1);
        assert_eq!(c.lead.wa_jid, "5511@s.whatsapp.net");

        // Fresh lease is not claimable again.
        assert!(store.claim_due("w2", 10, STALE, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_opted_out() {
        let store = seeded().await;
        store.upsert_lead(&Lead::new("l2", "5522@s.whatsapp.net", "Bo")).await.unwrap();
        let now = Utc::now();

        store
            .enqueue(NewFollowUp::new("l1", "later").at(epoch_ms(now) + 60_000), now)
            .await
            .unwrap();
        let opted = store.enqueue(NewFollowUp::new("l2", "promo"), now).await.unwrap();
        store.set_opt_out("l2", true).await.unwrap();

        assert!(store.claim_due("w1", 10, STALE, now).await.unwrap().is_empty());

        store.set_opt_out("l2", false).await.unwrap();
        let claimed = store.claim_due("w1", 10, STALE, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, opted.id);
    }

    #[tokio::test]
    async fn test_claim_limit_takes_oldest_first() {
        let store = seeded().await;
        let now = Utc::now();
        let newer = store
            .enqueue(NewFollowUp::new("l1", "t2").at(ago(now, 1_000)), now)
            .await
            .unwrap();
        let older = store
            .enqueue(NewFollowUp::new("l1", "t1").at(ago(now, 5_000)), now)
            .await
            .unwrap();

        let first = store.claim_due("w1", 1, STALE, now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].job.id, older.id);

        let second = store.claim_due("w1", 1, STALE, now).await.unwrap();
        assert_eq!(second[0].job.id, newer.id);
    }

    #[tokio::test]
    async fn test_stale_lease_reclaim_boundary() {
        let store = seeded().await;
        let t0 = Utc::now();
        let job = store.enqueue(NewFollowUp::new("l1", "reengage"), t0).await.unwrap();
        store.claim_due("w1", 10, STALE, t0).await.unwrap();

        let at_boundary = t0 + ChronoDuration::milliseconds(STALE.as_millis() as i64);
        assert!(store.claim_due("w2", 10, STALE, at_boundary).await.unwrap().is_empty());

        let after = at_boundary + ChronoDuration::milliseconds(1);
        let reclaimed = store.claim_due("w2", 10, STALE, after).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].job.id, job.id);
        assert_eq!(reclaimed[0].job.worker_id.as_deref(), Some("w2"));
        assert_eq!(reclaimed[0].job.attempts, 2);
    }

    #[tokio::test]
    async fn test_reschedule_clears_lease() {
        let store = seeded().await;
        let now = Utc::now();
        let job = store.enqueue(NewFollowUp::new("l1", "reengage"), now).await.unwrap();
        store.claim_due("w1", 10, STALE, now).await.unwrap();

        store
            .reschedule(&job.id, "w1", 15, Some("HTTP 500".into()), now)
            .await
            .unwrap();
        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FollowUpStatus::Scheduled);
        assert_eq!(job.processing_at, None);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.scheduled_at, Some(epoch_ms(now) + 15 * 60_000));
        assert_eq!(job.last_error.as_deref(), Some("HTTP 500"));
        assert_eq!(job.attempts, 1);

        let err = store.reschedule("nope", "w1", 1, None, now).await.unwrap_err();
        assert!(matches!(err, ZapflowError::NotFound(_)));

        // No lease any more: a second write-back is refused.
        let err = store.reschedule(&job.id, "w1", 1, None, now).await.unwrap_err();
        assert!(matches!(err, ZapflowError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_mark_sent_updates_lead_counters() {
        let store = seeded().await;
        let now = Utc::now();
        let job = store.enqueue(NewFollowUp::new("l1", "reengage"), now).await.unwrap();
        store.claim_due("w1", 10, STALE, now).await.unwrap();
        store.reschedule(&job.id, "w1", 0, Some("boom".into()), now).await.unwrap();
        store.claim_due("w1", 10, STALE, now).await.unwrap();

        let meta = DispatchMeta {
            variant: Some("B".into()),
        };
        store.mark_sent(&job.id, "w1", &meta, now).await.unwrap();

        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FollowUpStatus::Sent);
        assert_eq!(job.sent_at, Some(epoch_ms(now)));
        assert_eq!(job.last_error, None);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.variant.as_deref(), Some("B"));

        let lead = store.get_lead("l1").await.unwrap().unwrap();
        assert_eq!(lead.outbound_count, 1);
        assert_eq!(lead.last_outbound_at, Some(epoch_ms(now)));
    }

    #[tokio::test]
    async fn test_mark_failed_is_terminal() {
        let store = seeded().await;
        let now = Utc::now();
        let job = store.enqueue(NewFollowUp::new("l1", "reengage"), now).await.unwrap();
        store.claim_due("w1", 10, STALE, now).await.unwrap();
        store.mark_failed(&job.id, "w1", "max attempts", now).await.unwrap();

        let later = now + ChronoDuration::days(1);
        assert!(store.claim_due("w1", 10, STALE, later).await.unwrap().is_empty());

        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FollowUpStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("max attempts"));
        assert_eq!(job.processing_at, None);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 1);
    }

    #[tokio::test]
    async fn test_payloads_survive_storage() {
        let store = seeded().await;
        let now = Utc::now();
        let mut new = NewFollowUp::new("l1", "book demo")
            .with_constraints(JsonPayload::parse(r#"{"cooldownHours":2}"#).unwrap());
        new.cta = Some(JsonPayload::parse(r#"{"label":"Book"}"#).unwrap());
        new.ab_test = true;
        new.template_id = Some("tpl-1".into());
        let job = store.enqueue(new, now).await.unwrap();

        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.constraints.unwrap().cooldown_hours(), Some(2.0));
        assert_eq!(loaded.cta.unwrap().to_json_string(), r#"{"label":"Book"}"#);
        assert!(loaded.ab_test);
        assert_eq!(loaded.template_id.as_deref(), Some("tpl-1"));

        let listed = store.list(Some(FollowUpStatus::Scheduled), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list(Some(FollowUpStatus::Sent), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_on_final_attempt_fails_job() {
        let store = seeded().await;
        let t0 = Utc::now();
        let job = store
            .enqueue(NewFollowUp::new("l1", "reengage").with_max_attempts(1), t0)
            .await
            .unwrap();
        store.claim_due("w1", 10, STALE, t0).await.unwrap();

        let later = t0 + ChronoDuration::minutes(11);
        assert!(store.claim_due("w2", 10, STALE, later).await.unwrap().is_empty());

        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FollowUpStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn test_write_back_after_reclaim_is_refused() {
        let store = seeded().await;
        let t0 = Utc::now();
        let job = store.enqueue(NewFollowUp::new("l1", "reengage"), t0).await.unwrap();
        store.claim_due("w1", 10, STALE, t0).await.unwrap();
        let later = t0 + ChronoDuration::minutes(11);
        store.claim_due("w2", 10, STALE, later).await.unwrap();

        // w1 finishes late; none of its write-backs may touch w2's lease.
        let err = store
            .mark_sent(&job.id, "w1", &DispatchMeta::default(), later)
            .await
            .unwrap_err();
        assert!(matches!(err, ZapflowError::LeaseLost(_)));
        let err = store.reschedule(&job.id, "w1", 15, None, later).await.unwrap_err();
        assert!(matches!(err, ZapflowError::LeaseLost(_)));
        let err = store.mark_failed(&job.id, "w1", "boom", later).await.unwrap_err();
        assert!(matches!(err, ZapflowError::LeaseLost(_)));

        let current = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, FollowUpStatus::Processing);
        assert_eq!(current.worker_id.as_deref(), Some("w2"));
        assert_eq!(store.get_lead("l1").await.unwrap().unwrap().outbound_count, 0);

        store.mark_sent(&job.id, "w2", &DispatchMeta::default(), later).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_overlap() {
        let path = temp_db("concurrent");
        let setup = SqliteJobStore::open(&path, Duration::from_secs(5)).unwrap();
        setup.upsert_lead(&Lead::new("l1", "5511@s.whatsapp.net", "Ana")).await.unwrap();
        let now = Utc::now();
        for i in 0..40 {
            setup
                .enqueue(NewFollowUp::new("l1", &format!("job-{i}")).at(ago(now, 1_000)), now)
                .await
                .unwrap();
        }

        // Separate connections, as separate worker processes would have.
        let mut handles = Vec::new();
        for w in 0..4 {
            let store = SqliteJobStore::open(&path, Duration::from_secs(5)).unwrap();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let batch = store
                        .claim_due(&format!("w{w}"), 3, STALE, now)
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    ids.extend(batch.into_iter().map(|c| c.job.id));
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(total, 40);
        cleanup(&path);
    }
}
