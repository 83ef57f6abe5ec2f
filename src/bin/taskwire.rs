//! taskwire CLI: run a worker, the scheduler or the monitor, or submit a
//! task from the shell.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskwire::Producer;
use taskwire::broker::{Broker, PgmqBroker};
use taskwire::config::Config;
use taskwire::model::NewTask;
use taskwire::monitor::{LogSink, Monitor, MonitorConfig, NotificationSink, WebhookSink};
use taskwire::scheduler::{PgScheduleStore, Scheduler, SchedulerConfig, load_schedule_file};
use taskwire::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use taskwire::worker::{Registry, Worker, WorkerConfig, register_builtins};

#[derive(Parser)]
#[command(name = "taskwire", about = "Distributed task queue over Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker with the built-in handlers
    Worker {
        /// Parallel execution slots
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Seconds a popped task stays invisible to other workers
        #[arg(long, default_value_t = 600)]
        visibility_timeout: u64,
    },
    /// Run the periodic scheduler
    Scheduler {
        /// TOML file with [[schedule]] entries to register at startup
        #[arg(long)]
        schedule: Option<PathBuf>,
        /// Seconds between scans of the schedule table
        #[arg(long, default_value_t = 5)]
        tick: u64,
    },
    /// Relay lifecycle events to the log or a webhook
    Monitor {
        /// POST events to this URL instead of logging them
        #[arg(long)]
        webhook: Option<String>,
        /// Milliseconds an out-of-order event waits for its predecessor
        #[arg(long, default_value_t = 2000)]
        window: u64,
    },
    /// Submit a task
    Submit {
        /// Registered task name
        name: String,
        /// JSON array of positional arguments
        #[arg(long)]
        args: Option<String>,
        /// JSON object of keyword arguments
        #[arg(long)]
        kwargs: Option<String>,
        /// Delay execution by this many seconds
        #[arg(long)]
        countdown: Option<u64>,
        /// Override the retry bound
        #[arg(long)]
        max_retries: Option<u32>,
        /// Target queue (defaults to TASKWIRE_QUEUE)
        #[arg(long)]
        queue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let broker = PgmqBroker::connect(config.database_url.expose_secret()).await?;
    broker.migrate().await?;

    match cli.command {
        Command::Worker {
            concurrency,
            visibility_timeout,
        } => cmd_worker(&config, broker, concurrency, visibility_timeout).await,
        Command::Scheduler { schedule, tick } => cmd_scheduler(&config, broker, schedule, tick).await,
        Command::Monitor { webhook, window } => cmd_monitor(&config, broker, webhook, window).await,
        Command::Submit {
            name,
            args,
            kwargs,
            countdown,
            max_retries,
            queue,
        } => cmd_submit(&config, broker, name, args, kwargs, countdown, max_retries, queue).await,
    }
}

fn telemetry(config: &Config, service: &str) -> anyhow::Result<TelemetryGuard> {
    let guard = init_telemetry(
        TelemetryConfig::new(service)
            .with_endpoint(config.otel_endpoint.clone())
            .with_default_filter(&config.log_level),
    )?;
    Ok(guard)
}

async fn cmd_worker(
    config: &Config,
    broker: PgmqBroker,
    concurrency: usize,
    visibility_timeout: u64,
) -> anyhow::Result<()> {
    let _guard = telemetry(config, "taskwire-worker")?;

    let mut registry = Registry::new();
    register_builtins(&mut registry);

    let worker = Worker::new(
        Arc::new(broker),
        Arc::new(registry),
        WorkerConfig {
            queue: config.queue.clone(),
            concurrency,
            visibility_timeout: Duration::from_secs(visibility_timeout),
            ..WorkerConfig::default()
        },
    );

    let handle = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_scheduler(
    config: &Config,
    broker: PgmqBroker,
    schedule: Option<PathBuf>,
    tick: u64,
) -> anyhow::Result<()> {
    let _guard = telemetry(config, "taskwire-scheduler")?;

    let store = PgScheduleStore::new(broker.pool().clone());
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(broker),
        Arc::new(store),
        SchedulerConfig {
            tick: Duration::from_secs(tick.max(1)),
            default_queue: config.queue.clone(),
            ..SchedulerConfig::default()
        },
    ));

    if let Some(path) = schedule {
        let entries = load_schedule_file(&path, chrono::Utc::now())?;
        scheduler.register_all(entries).await?;
    }

    let handle = Arc::clone(&scheduler);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    scheduler.run().await?;
    Ok(())
}

async fn cmd_monitor(
    config: &Config,
    broker: PgmqBroker,
    webhook: Option<String>,
    window: u64,
) -> anyhow::Result<()> {
    let _guard = telemetry(config, "taskwire-monitor")?;

    let sink: Arc<dyn NotificationSink> = match webhook {
        Some(url) => Arc::new(WebhookSink::new(url)?),
        None => Arc::new(LogSink),
    };
    let monitor = Arc::new(Monitor::new(
        Arc::new(broker),
        sink,
        MonitorConfig {
            reorder_window: Duration::from_millis(window),
            ..MonitorConfig::default()
        },
    ));

    let handle = Arc::clone(&monitor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    monitor.run().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_submit(
    config: &Config,
    broker: PgmqBroker,
    name: String,
    args: Option<String>,
    kwargs: Option<String>,
    countdown: Option<u64>,
    max_retries: Option<u32>,
    queue: Option<String>,
) -> anyhow::Result<()> {
    let args: Vec<serde_json::Value> = match args {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    let kwargs: serde_json::Map<String, serde_json::Value> = match kwargs {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Map::new(),
    };

    let queue = queue.unwrap_or_else(|| config.queue.clone());
    broker.ensure_queue(&queue).await?;

    let mut task = NewTask::new(&name).args(args).kwargs(kwargs).queue(&queue);
    if let Some(secs) = countdown {
        task = task.countdown(Duration::from_secs(secs));
    }
    if let Some(n) = max_retries {
        task = task.max_retries(n);
    }

    let producer = Producer::new(Arc::new(broker));
    let id = producer.send(task).await?;
    println!("Submitted: {id} ({name} on {queue})");
    Ok(())
}
