//! # Zapflow Scheduler
//!
//! Durable outbound follow-up queue for WhatsApp leads.
//! Multiple worker processes poll one SQLite store; an atomic claim keeps
//! them from sending the same follow-up twice.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval, per worker)
//!   ├── JobStore::claim_due ── leases due + stale jobs (BEGIN IMMEDIATE)
//!   ├── Dispatcher ── HTTP POST to the messaging automation
//!   │     ├── SENT   → mark_sent (+ lead outbound counters)
//!   │     ├── QUEUED → reschedule: cooldown │ best time │ backoff
//!   │     └── error  → reschedule with backoff, or mark_failed
//!   └── SchedulerHandle::shutdown
//!
//! DebounceAggregator (inbound side)
//!   └── per-sender burst buffer → one flush after the quiet period
//! ```

pub mod backoff;
pub mod best_time;
pub mod debounce;
pub mod dispatch;
pub mod engine;
pub mod persistence;
pub mod store;

pub use backoff::BackoffPolicy;
pub use debounce::{DebounceAggregator, DebounceOptions, InboundMessage, SenderEvent};
pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher, HttpDispatcher, idempotency_key};
pub use engine::{JobOutcome, SchedulerEngine, SchedulerHandle, SchedulerSettings, TickReport};
pub use persistence::SqliteJobStore;
pub use store::{ClaimedJob, DispatchMeta, JobStore};
