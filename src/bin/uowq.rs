//! uowq CLI: run the worker and poke at its queue and bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uowq::config::{Config, WorkerSettings};
use uowq::db::Db;
use uowq::db::pgmq::PgmqQueue;
use uowq::engine::{StopOutcome, Worker};
use uowq::log::{EventLog, TracingSink};
use uowq::model::{Limit, UnitOfWork};
use uowq::processor::HookProcessor;
use uowq::store::{KvStore, try_count_key};
use uowq::telemetry::{TelemetryConfig, init_telemetry};

const SERVICE_NAME: &str = "uowq";

#[derive(Parser)]
#[command(name = "uowq", about = "Queue-driven unit-of-work processor")]
struct Cli {
    /// Worker settings file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker until Ctrl-C
    Serve {
        /// Run a single fetch/process/ack cycle and exit
        #[arg(long)]
        run_once: bool,
    },
    /// Send a unit of work to the queue
    Enqueue {
        /// Unit of work ID
        id: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Seconds after creation the unit may still be retried (-1 = unlimited)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        max_age: i64,
        /// Attempt ceiling (-1 = unlimited)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        max_retries: i64,
    },
    /// Print the persisted try-count of a unit of work
    TryCount {
        /// Unit of work ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => WorkerSettings::load(path)?,
        None => WorkerSettings::default(),
    };

    match cli.command {
        Command::Serve { run_once } => cmd_serve(settings, run_once).await,
        Command::Enqueue {
            id,
            payload,
            max_age,
            max_retries,
        } => {
            let db = connect(&settings).await?;
            cmd_enqueue(&db, &settings, id, payload, max_age, max_retries).await
        }
        Command::TryCount { id } => {
            let db = connect(&settings).await?;
            cmd_try_count(&db, &id).await
        }
    }
}

async fn connect(settings: &WorkerSettings) -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(&config.database_url).await?;
    db.migrate().await?;
    db.create_queue(&settings.queue_name).await?;
    Ok(db)
}

async fn cmd_serve(settings: WorkerSettings, run_once: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: SERVICE_NAME.to_string(),
        instance_id: config.worker_name.clone(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(&config.database_url).await?);
    db.migrate().await?;
    db.create_queue(&settings.queue_name).await?;

    let log = EventLog::new(Arc::new(TracingSink), &config.worker_name, "Worker");
    let queue = Arc::new(PgmqQueue::new(
        Arc::clone(&db),
        settings.queue_name.clone(),
        &log,
    ));
    let processor = Arc::new(HookProcessor::new(
        settings.processor.command.clone(),
        settings.processor_timeout(),
    ));

    let worker = Arc::new(Worker::new(queue, db, processor, log, settings));

    let stopper = Arc::clone(&worker);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        if stopper.stop().await == StopOutcome::TimedOut {
            warn!("worker did not stop in time, exiting anyway");
            std::process::exit(1);
        }
    });

    info!(worker = %config.worker_name, run_once, "serving");
    worker.run(run_once).await;
    worker.cleanup().wait_idle().await;
    Ok(())
}

async fn cmd_enqueue(
    db: &Db,
    settings: &WorkerSettings,
    id: String,
    payload: Option<String>,
    max_age: i64,
    max_retries: i64,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Value::Null,
    };
    let max_age = Limit::try_from(max_age).map_err(anyhow::Error::msg)?;
    let max_retries = Limit::try_from(max_retries).map_err(anyhow::Error::msg)?;

    let unit = UnitOfWork::new(id)
        .max_age_seconds(max_age)
        .max_retries(max_retries)
        .payload(payload);
    let msg_id = db.send_to_queue(&settings.queue_name, &unit).await?;

    println!(
        "Enqueued: {} (message {msg_id}, max age {}, max retries {})",
        unit.id, unit.max_age_seconds, unit.max_retries
    );
    Ok(())
}

async fn cmd_try_count(db: &Db, id: &str) -> anyhow::Result<()> {
    match db.get(&try_count_key(id)).await? {
        Some(count) => println!("{id}: {count}"),
        None => println!("{id}: no try-count recorded"),
    }
    Ok(())
}
