//! # Zapflow — outbound follow-up worker
//!
//! Runs the follow-up scheduler against the local SQLite store and offers a
//! few admin commands for the same store.
//!
//! Usage:
//!   zapflow worker                                  # Poll and dispatch until Ctrl-C
//!   zapflow lead l1 5511999999999@s.whatsapp.net    # Create or update a lead
//!   zapflow enqueue l1 "reengage after demo"        # Queue a follow-up (ASAP)
//!   zapflow stats                                   # Count jobs per status

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use zapflow_core::{FollowUpStatus, JsonPayload, Lead, NewFollowUp, ZapflowConfig, epoch_ms};
use zapflow_scheduler::{HttpDispatcher, JobStore, SchedulerEngine, SchedulerSettings, SqliteJobStore};

#[derive(Parser)]
#[command(name = "zapflow", version, about = "📣 Zapflow — outbound follow-up scheduler")]
struct Cli {
    /// Config file (default: ~/.zapflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until Ctrl-C
    Worker {
        /// Override the worker id (default: hostname-pid)
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Queue a follow-up for a lead
    Enqueue {
        lead_id: String,
        objective: String,
        /// Due time, RFC 3339 (default: as soon as possible)
        #[arg(long, conflicts_with = "in_minutes")]
        at: Option<DateTime<Utc>>,
        /// Due in N minutes
        #[arg(long)]
        in_minutes: Option<i64>,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Constraints JSON object, e.g. '{"cooldownHours": 2}'
        #[arg(long)]
        constraints: Option<String>,
        /// Call-to-action JSON object
        #[arg(long)]
        cta: Option<String>,
        #[arg(long)]
        ab_test: bool,
        #[arg(long)]
        template_id: Option<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long)]
        command_id: Option<String>,
    },
    /// Create or update a lead
    Lead {
        id: String,
        wa_jid: String,
        #[arg(long, default_value = "")]
        name: String,
        /// Stop all outbound follow-ups to this lead
        #[arg(long, conflicts_with = "opt_in")]
        opt_out: bool,
        /// Resume outbound follow-ups
        #[arg(long)]
        opt_in: bool,
    },
    /// Show one follow-up as JSON
    Show { id: String },
    /// List recent follow-ups
    List {
        /// scheduled | processing | sent | failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Count follow-ups per status
    Stats,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&Path>) -> Result<ZapflowConfig> {
    let mut config = match path {
        Some(p) => ZapflowConfig::load_from(p)
            .with_context(|| format!("loading config from {}", p.display()))?,
        None => ZapflowConfig::load().context("loading default config")?,
    };
    config.apply_env().context("applying ZAPFLOW_* overrides")?;
    Ok(config)
}

fn parse_payload(label: &str, raw: Option<String>) -> Result<Option<JsonPayload>> {
    raw.map(|s| JsonPayload::parse(&s).with_context(|| format!("invalid --{label}")))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "zapflow=debug,zapflow_scheduler=debug,zapflow_core=debug"
    } else {
        "zapflow=info,zapflow_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_deref())?;

    let db_path = expand_path(&config.store.db_path);
    let store = SqliteJobStore::open(Path::new(&db_path), config.store.busy_timeout())
        .with_context(|| format!("opening store at {db_path}"))?;

    match cli.command {
        Command::Worker { worker_id } => {
            if worker_id.is_some() {
                config.scheduler.worker_id = worker_id;
            }
            let settings = SchedulerSettings::from(&config.scheduler);
            let dispatcher = HttpDispatcher::new(&config.dispatch);

            println!("📣 Zapflow worker v{}", env!("CARGO_PKG_VERSION"));
            println!("   🆔 Worker:    {}", settings.worker_id);
            println!("   🗄️  Database:  {db_path}");
            println!("   🌐 Dispatch:  {}", config.dispatch.url);
            println!("   ⏱️  Interval:  {}s (batch {})", settings.poll_interval.as_secs(), settings.batch_limit);
            println!();

            let engine = Arc::new(SchedulerEngine::new(Arc::new(store), Arc::new(dispatcher), settings));
            let handle = engine.spawn();

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            tracing::info!("Shutdown requested, finishing current tick");
            handle.shutdown().await;
        }
        Command::Enqueue {
            lead_id,
            objective,
            at,
            in_minutes,
            max_attempts,
            constraints,
            cta,
            ab_test,
            template_id,
            idempotency_key,
            command_id,
        } => {
            let now = Utc::now();
            let scheduled_at = match (at, in_minutes) {
                (Some(at), _) => Some(epoch_ms(at)),
                (None, Some(m)) => Some(epoch_ms(now + chrono::Duration::minutes(m))),
                (None, None) => None,
            };
            let new = NewFollowUp {
                lead_id,
                objective,
                scheduled_at,
                max_attempts,
                constraints: parse_payload("constraints", constraints)?,
                cta: parse_payload("cta", cta)?,
                ab_test,
                template_id,
                idempotency_key,
                command_id,
            };
            let job = store.enqueue(new, now).await.context("enqueueing follow-up")?;
            println!("✅ Queued follow-up {} for lead {}", job.id, job.lead_id);
        }
        Command::Lead {
            id,
            wa_jid,
            name,
            opt_out,
            opt_in,
        } => {
            let mut lead = store
                .get_lead(&id)
                .await?
                .unwrap_or_else(|| Lead::new(&id, &wa_jid, &name));
            lead.wa_jid = wa_jid;
            if !name.is_empty() {
                lead.name = name;
            }
            store.upsert_lead(&lead).await.context("saving lead")?;
            if opt_out || opt_in {
                store.set_opt_out(&lead.id, opt_out).await.context("updating opt-out")?;
                lead.opted_out = opt_out;
            }
            println!("✅ Lead {} saved{}", lead.id, if lead.opted_out { " (opted out)" } else { "" });
        }
        Command::Show { id } => match store.get(&id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => anyhow::bail!("follow-up '{id}' not found"),
        },
        Command::List { status, limit } => {
            let status = status.as_deref().map(FollowUpStatus::parse).transpose()?;
            for job in store.list(status, limit).await? {
                println!(
                    "{}  {:<10}  lead={}  attempts={}/{}  {}",
                    job.id, job.status, job.lead_id, job.attempts, job.max_attempts, job.objective
                );
            }
        }
        Command::Stats => {
            let counts = store.stats().await?;
            println!("📊 Follow-ups");
            println!("   scheduled:  {}", counts.scheduled);
            println!("   processing: {}", counts.processing);
            println!("   sent:       {}", counts.sent);
            println!("   failed:     {}", counts.failed);
            println!("   total:      {}", counts.total());
        }
    }

    Ok(())
}
