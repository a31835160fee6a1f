use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colloquy_worker::{App, WorkerConfig};
use coordination::debate::{run_debate_key, RUN_DEBATE};
use coordination::ledger::EventQuery;
use coordination::queue::{EnqueueOptions, JobFilter, JobStatus};
use coordination::worker::IterationOutcome;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (overrides COLLOQUY_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config file and COLLOQUY_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker loop and the trigger scheduler until ctrl-c
    Worker {
        /// Process at most one job, then exit
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Worker id (overrides COLLOQUY_WORKER_ID)
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Enqueue a debate run (idempotent per debate)
    Debate {
        debate_id: String,

        /// Request id carried into the run's ledger events
        #[arg(long)]
        request_id: Option<String>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Enqueue an arbitrary job
    Enqueue {
        job_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Idempotency key
        #[arg(long)]
        key: Option<String>,

        #[arg(long)]
        max_attempts: Option<u32>,

        /// Delay before the job becomes eligible
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// List jobs, newest first
    Jobs {
        /// pending, running, completed or failed
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List runs by most recent activity
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one run snapshot
    Run { run_id: String },

    /// List ledger events
    Events {
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Import completed debates that predate the run ledger
    Migrate {
        /// Maximum runs to import (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_status(status: &str) -> Result<JobStatus> {
    Ok(match status {
        "pending" => JobStatus::Pending,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        other => bail!("unknown job status '{other}'"),
    })
}

async fn run_worker(app: App, once: bool) -> Result<()> {
    let worker = app.worker()?;

    if once {
        let outcome = worker.run_once().await.context("Worker iteration failed")?;
        info!(?outcome, "Single iteration finished");
        if let IterationOutcome::Failed { code, .. } = outcome {
            bail!("job failed: {code}");
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let scheduler = app.scheduler()?;
    let scheduler_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, finishing current job");
                cancel.cancel();
            }
        });
    }

    let result = worker.run(cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }
    result.context("Worker stopped on infrastructure failure")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = WorkerConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    match args.command {
        Command::Worker { once, worker_id } => {
            if let Some(id) = worker_id {
                config.worker_id = Some(id);
            }
            info!(
                data_dir = %config.data_dir.display(),
                completion = %config.completion.url,
                "Colloquy worker starting"
            );
            run_worker(App::open(config)?, once).await?;
        }
        Command::Debate {
            debate_id,
            request_id,
            max_attempts,
        } => {
            let app = App::open(config)?;
            if app.sessions.load(&debate_id)?.is_none() {
                bail!("debate {debate_id} not found in session store");
            }
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut opts = EnqueueOptions::default().idempotency_key(run_debate_key(&debate_id));
            if let Some(n) = max_attempts {
                opts = opts.max_attempts(n);
            }
            let outcome = app.queue.enqueue(
                RUN_DEBATE,
                serde_json::json!({ "debateId": debate_id, "requestId": request_id }),
                opts,
            )?;
            print_json(&outcome)?;
        }
        Command::Enqueue {
            job_type,
            payload,
            key,
            max_attempts,
            delay_secs,
        } => {
            let app = App::open(config)?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let mut opts = EnqueueOptions::default();
            if let Some(key) = key {
                opts = opts.idempotency_key(key);
            }
            if let Some(n) = max_attempts {
                opts = opts.max_attempts(n);
            }
            if let Some(secs) = delay_secs {
                let secs = i64::try_from(secs).context("--delay-secs is too large")?;
                opts = opts.available_at(chrono::Utc::now() + chrono::Duration::seconds(secs));
            }
            print_json(&app.queue.enqueue(&job_type, payload, opts)?)?;
        }
        Command::Jobs { status, limit } => {
            let app = App::open(config)?;
            let filter = JobFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                job_type: None,
                limit,
            };
            print_json(&app.queue.list(&filter)?)?;
        }
        Command::Runs { limit } => {
            let app = App::open(config)?;
            print_json(&app.ledger.list_runs(app.queue.as_ref(), limit)?)?;
        }
        Command::Run { run_id } => {
            let app = App::open(config)?;
            match app.ledger.runs.get_by_id(&run_id)? {
                Some(run) => print_json(&run)?,
                None => bail!("run {run_id} not found"),
            }
        }
        Command::Events { run_id, limit } => {
            let app = App::open(config)?;
            let query = EventQuery { limit, run_id };
            print_json(&app.ledger.events.list_events(&query)?)?;
        }
        Command::Migrate { limit } => {
            let app = App::open(config)?;
            let imported = app
                .ledger
                .runs
                .migrate_from_legacy_debates(app.sessions.as_ref(), limit)?;
            println!("imported {imported} debate run(s)");
        }
    }

    Ok(())
}
