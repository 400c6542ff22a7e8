//! Settlement Server - Main entry point
//!
//! Runs the recurring settlement jobs, lists the catalog, or triggers one
//! job by hand.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};
use tokio_util::sync::CancellationToken;

use settlement_core::{
    capabilities::Capabilities,
    config::{BackendKind, Config},
    jobs::{register_jobs, DurableBackend, IntervalBackend, JobDescriptor, JobRegistry, RedisBackend},
    ledger::{InMemoryStore, LedgerStore, PgStore},
    notify::{
        BroadcastSink, ChannelBroadcaster, EmailDispatcher, InMemoryOutbox, NotificationDispatcher, Notifier,
        RedisEmailQueue,
    },
    settings::{InMemorySettings, Settings, SettingsStore},
    settlement::SettlementContext,
    telemetry,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "settlement-server",
    version,
    about = "Cron orchestration and recurring financial settlement engine",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "SETTLEMENT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register schedules and run jobs until interrupted
    Run,
    /// Print the job catalog
    Jobs,
    /// Run one job now and exit
    Trigger {
        /// Job name, e.g. processStakingPositions
        name: String,
    },
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Period")]
    period: String,
    #[tabled(rename = "Status")]
    status: String,
}

impl From<JobDescriptor> for JobRow {
    fn from(job: JobDescriptor) -> Self {
        Self {
            name: job.name,
            title: job.title,
            category: job.category,
            period: format_period(job.period_ms),
            status: job.status.to_string(),
        }
    }
}

fn format_period(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        s if s >= 86_400 && s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s >= 3_600 && s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s >= 60 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    let config = Arc::new(config);

    let telemetry = telemetry::init(&config)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Settlement Server");

    let broadcast = Arc::new(ChannelBroadcaster::default());
    let ctx = build_context(config.clone(), broadcast.clone()).await?;
    let registry = JobRegistry::new(broadcast, config.scheduler.status_reset_delay);
    register_jobs(&registry, ctx)?;

    let outcome = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, registry).await,
        Commands::Jobs => {
            let rows: Vec<JobRow> = registry.get_cron_jobs().into_iter().map(JobRow::from).collect();
            let table = Table::new(rows)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
            Ok(())
        }
        Commands::Trigger { name } => {
            if registry.get_job(&name).is_none() {
                anyhow::bail!("unknown job: {}", name);
            }
            let ok = registry.trigger_job(&name).await;
            if let Some(job) = registry.get_job(&name) {
                println!("{}: {}", job.name, job.status);
                if let Some(error) = job.last_run_error {
                    println!("  error: {}", error);
                }
            }
            if ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("job {} did not complete", name))
            }
        }
    };

    telemetry.shutdown();
    outcome
}

/// Wire the store, settings, notifier and capabilities. Without a database
/// URL everything stays in memory.
async fn build_context(config: Arc<Config>, broadcast: Arc<ChannelBroadcaster>) -> anyhow::Result<SettlementContext> {
    let outbox = Arc::new(InMemoryOutbox::default());

    let store: Arc<dyn LedgerStore>;
    let users: Arc<dyn NotificationDispatcher>;
    let settings: Arc<dyn SettingsStore>;
    if config.database.url.is_empty() {
        tracing::warn!("No database configured, using the in-memory ledger");
        store = Arc::new(InMemoryStore::new());
        users = outbox.clone();
        settings = Arc::new(InMemorySettings::new());
    } else {
        let pg = PgStore::connect(&config.database).await?;
        pg.migrate().await?;
        tracing::info!("Connected to database");
        let pg = Arc::new(pg);
        store = pg.clone();
        users = pg.clone();
        settings = pg;
    }

    let email: Arc<dyn EmailDispatcher> = match &config.redis.url {
        Some(url) => Arc::new(RedisEmailQueue::new(url, &config.scheduler.key_prefix)?),
        None => outbox,
    };

    let broadcast: Arc<dyn BroadcastSink> = broadcast;
    let notifier = Notifier::new(users, email, broadcast);
    let capabilities = Arc::new(Capabilities::new(config.capabilities.installed.iter().copied()));

    Ok(SettlementContext::new(
        store,
        Settings::new(settings),
        notifier,
        capabilities,
        config,
    ))
}

async fn run(config: &Config, registry: JobRegistry) -> anyhow::Result<()> {
    let backend: Arc<dyn DurableBackend> = match config.scheduler.backend {
        BackendKind::Local => Arc::new(IntervalBackend::new()),
        BackendKind::Redis => {
            let url = config
                .redis
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("scheduler.backend = redis needs redis.url"))?;
            Arc::new(RedisBackend::connect(url, &config.scheduler.key_prefix, config.scheduler.poll_interval).await?)
        }
    };

    registry.schedule_all(backend.as_ref()).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    backend.run(Arc::new(registry), shutdown).await?;
    tracing::info!("Settlement server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
