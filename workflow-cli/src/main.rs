//! Operator CLI for the workflow engine (§9 "Operational surfaces"): emit a
//! domain event by hand, run one maintenance pass, inspect a run, or replay a
//! dead-lettered job, all against the same Postgres-backed store the server
//! process uses.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use workflow_core::model::{DomainEvent, EventKind, JobStatus};
use workflow_core::queue::{JobQueue, StoreBackedQueue};
use workflow_core::store::postgres::PostgresStore;
use workflow_core::store::StateStore;
use workflow_core::{Config, Resumer, Supervisor, TriggerMatcher};

#[derive(Parser)]
#[command(name = "workflow-cli")]
#[command(about = "Operator CLI for the workflow automation engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Emit a domain event against a lead payload read from a JSON file.
    Emit {
        #[arg(value_enum)]
        kind: EmitKind,
        #[arg(long)]
        tenant_id: String,
        #[arg(long)]
        lead_id: String,
        /// Path to a JSON file holding the lead snapshot (and, for
        /// `lead-updated`, an optional `changes` sibling field).
        #[arg(long)]
        lead_file: std::path::PathBuf,
        /// Required for `manual`: the workflow definition to target directly.
        #[arg(long)]
        definition_id: Option<String>,
    },
    /// Run one supervisor reclaim pass over stuck runs/jobs.
    Recover {
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Run one supervisor prune pass over old terminal runs/jobs.
    Cleanup {
        #[arg(long)]
        days: Option<i64>,
        #[arg(long)]
        failed_days: Option<i64>,
    },
    /// Print the current health counts and score.
    Health,
    /// Print a run's current state and execution path.
    InspectRun { run_id: String },
    /// List dead-lettered jobs.
    ListDeadLetters,
    /// Re-enqueue a dead-lettered job's underlying job for another attempt.
    ReplayDeadLetter { id: String },
}

#[derive(Clone, clap::ValueEnum)]
enum EmitKind {
    LeadCreated,
    LeadUpdated,
    AppointmentScheduled,
    Manual,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = sqlx::PgPool::connect(&config.database_url).await?;
    let store: Arc<dyn StateStore> = Arc::new(PostgresStore::new(pool));
    let queue: Arc<dyn JobQueue> = Arc::new(StoreBackedQueue::new(store.clone()));

    match cli.command {
        Commands::Emit { kind, tenant_id, lead_id, lead_file, definition_id } => {
            emit(store.clone(), queue.clone(), kind, tenant_id, lead_id, lead_file, definition_id).await?
        }
        Commands::Recover { hours } => {
            let resumer = Arc::new(Resumer::new(store.clone(), queue.clone()));
            let supervisor = Supervisor::new(store, queue, resumer, config.supervisor, config.retention);
            let report = supervisor.reclaim(hours).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "scanned": report.scanned,
                "jobsReset": report.jobs_reset,
                "failedStuck": report.failed_stuck,
            }))?);
        }
        Commands::Cleanup { days, failed_days } => {
            let resumer = Arc::new(Resumer::new(store.clone(), queue.clone()));
            let supervisor = Supervisor::new(store, queue, resumer, config.supervisor, config.retention);
            let report = supervisor.prune(days, failed_days).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "runsDeleted": report.runs_deleted,
                "jobsDeleted": report.jobs_deleted,
            }))?);
        }
        Commands::Health => {
            let resumer = Arc::new(Resumer::new(store.clone(), queue.clone()));
            let supervisor = Supervisor::new(store, queue, resumer, config.supervisor, config.retention);
            let report = supervisor.health().await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "totals": report.totals,
                "active": report.active,
                "waiting": report.waiting,
                "completed24h": report.completed_24h,
                "failed24h": report.failed_24h,
                "stuck": report.stuck,
                "pendingJobs": report.pending_jobs,
                "processingJobs": report.processing_jobs,
                "healthScore": report.health_score,
            }))?);
        }
        Commands::InspectRun { run_id } => {
            match store.get_run(&run_id).await? {
                Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                None => anyhow::bail!("no such run: {run_id}"),
            }
        }
        Commands::ListDeadLetters => {
            let letters = store.list_dead_letters().await?;
            println!("{}", serde_json::to_string_pretty(&letters)?);
        }
        Commands::ReplayDeadLetter { id } => {
            let Some(letter) = store.get_dead_letter(&id).await? else {
                anyhow::bail!("no such dead letter: {id}");
            };
            let mut job = letter.job;
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.last_error = None;
            job.scheduled_for = chrono::Utc::now();
            queue.enqueue(job).await?;
            store.remove_dead_letter(&id).await?;
            println!("replayed dead letter {id}");
        }
    }

    Ok(())
}

async fn emit(
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    kind: EmitKind,
    tenant_id: String,
    lead_id: String,
    lead_file: std::path::PathBuf,
    definition_id: Option<String>,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&lead_file)?;
    let mut doc: serde_json::Value = serde_json::from_str(&raw)?;
    let changes = doc.as_object_mut().and_then(|obj| obj.remove("changes"));
    let appointment = doc.as_object_mut().and_then(|obj| obj.remove("appointment"));

    let event_kind = match kind {
        EmitKind::LeadCreated => EventKind::LeadCreated,
        EmitKind::LeadUpdated => EventKind::LeadUpdated,
        EmitKind::AppointmentScheduled => EventKind::AppointmentScheduled,
        EmitKind::Manual => EventKind::Manual,
    };

    let force_definition_id = if matches!(event_kind, EventKind::Manual) {
        Some(definition_id.ok_or_else(|| anyhow::anyhow!("--definition-id is required for manual events"))?)
    } else {
        None
    };

    let event = DomainEvent {
        kind: event_kind,
        tenant_id,
        lead_id,
        payload: doc,
        changes,
        appointment,
        force_definition_id,
        occurred_at: chrono::Utc::now(),
    };

    let matcher = TriggerMatcher::new(store, queue);
    let outcome = matcher.handle_event(event).await?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "createdRunIds": outcome.created_run_ids,
        "skips": outcome.skips.iter().map(|(id, _)| id).collect::<Vec<_>>(),
        "errors": outcome.errors,
    }))?);
    Ok(())
}
