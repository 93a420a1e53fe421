//! realmwatchd: the Realmwatch daemon.
//!
//! Single binary that assembles all Realmwatch subsystems:
//! - Status store (redb)
//! - Status fetcher (dfx CLI or HTTP)
//! - Scheduler control loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! realmwatchd serve --config realmwatch.toml --port 5000 --data-dir /var/lib/realmwatch
//! realmwatchd sweep --config realmwatch.toml
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use realm_core::config::FetcherKind;
use realm_core::{RealmConfig, RealmwatchConfig};
use realmwatch_health::{DfxStatusFetcher, HealthScorer, HttpStatusFetcher, StatusFetcher};
use realmwatch_scheduler::{ConfigError, Scheduler, SchedulerError};
use realmwatch_state::StatusStore;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,realmwatchd=debug,realmwatch=debug";
const DEFAULT_DATA_DIR: &str = "/var/lib/realmwatch";
const DB_FILE: &str = "realmwatch.redb";

#[derive(Parser)]
#[command(name = "realmwatchd", about = "Realmwatch realm status daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the REST API until interrupted.
    Serve {
        /// TOML config file. Environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on. Defaults to `api.port` from the config.
        #[arg(long)]
        port: Option<u16>,

        /// Directory holding the status database.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Fetch every registered realm once and print the results as JSON.
    Sweep {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => run_serve(config, port, data_dir).await,
        Command::Sweep { config, data_dir } => run_sweep(config, data_dir).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run_serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Realmwatch daemon starting");

    let config = RealmwatchConfig::load(config_path.as_deref())?;
    let port = port.unwrap_or(config.api.port);

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&store_path(&config, data_dir))?;
    let scheduler = build_scheduler(&config, store)?;
    let realms = seed_realms(&scheduler, &config.realms).await?;
    info!(
        realms,
        fetcher = ?config.fetcher.kind,
        network = %config.scheduler.network,
        "scheduler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown_rx).await;
        })
    };

    if config.scheduler.enabled {
        scheduler.start();
    } else {
        info!("scheduler disabled, start it with POST /api/v1/scheduler/start");
    }

    // ── Start API server ───────────────────────────────────────

    let router = realmwatch_api::build_router(scheduler);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // In-flight fetch cycles are not cancelled; the loop just stops ticking.
    let _ = scheduler_handle.await;

    info!("Realmwatch daemon stopped");
    Ok(())
}

async fn run_sweep(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = RealmwatchConfig::load(config_path.as_deref())?;
    let store = open_store(&store_path(&config, data_dir))?;
    let scheduler = build_scheduler(&config, store)?;
    seed_realms(&scheduler, &config.realms).await?;

    let principals: Vec<String> = scheduler
        .list_realms()
        .await
        .into_iter()
        .map(|realm| realm.principal)
        .collect();
    if principals.is_empty() {
        warn!("no realms registered, nothing to sweep");
        return Ok(());
    }

    info!(count = principals.len(), "sweeping realms");
    let results = scheduler.batch_fetch(&principals, None).await;

    let report: BTreeMap<String, serde_json::Value> = results
        .into_iter()
        .map(|(principal, result)| {
            let entry = match result {
                Ok(record) => serde_json::json!({
                    "success": true,
                    "record_id": record.id,
                    "health_score": record.health_score,
                    "created_at": record.created_at,
                }),
                Err(e) => serde_json::json!({
                    "success": false,
                    "error": e.to_string(),
                }),
            };
            (principal, entry)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `--data-dir` wins over `storage.path`, which wins over the default directory.
fn store_path(config: &RealmwatchConfig, data_dir: Option<PathBuf>) -> PathBuf {
    match (data_dir, &config.storage.path) {
        (Some(dir), _) => dir.join(DB_FILE),
        (None, Some(path)) => path.clone(),
        (None, None) => Path::new(DEFAULT_DATA_DIR).join(DB_FILE),
    }
}

fn open_store(path: &Path) -> anyhow::Result<StatusStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let store = StatusStore::open(path)?;
    info!(path = ?path, "status store opened");
    Ok(store)
}

fn build_scheduler(config: &RealmwatchConfig, store: StatusStore) -> anyhow::Result<Scheduler> {
    let fetcher: Arc<dyn StatusFetcher> = match config.fetcher.kind {
        FetcherKind::Dfx => Arc::new(DfxStatusFetcher::new(config.fetcher.dfx_binary.as_str())),
        FetcherKind::Http => Arc::new(HttpStatusFetcher::new(
            config.fetcher.status_path.as_str(),
        )?),
    };
    let scorer = HealthScorer::new(config.scoring.activity_window_days);
    Ok(Scheduler::new(
        config.scheduler.clone(),
        scorer,
        fetcher,
        Arc::new(store),
    ))
}

/// Register realms persisted by earlier runs, then the configured ones.
/// A configured realm that is already registered is updated in place.
async fn seed_realms(scheduler: &Scheduler, configured: &[RealmConfig]) -> anyhow::Result<usize> {
    for realm in scheduler.persisted_realms().await? {
        let principal = realm.principal.clone();
        if let Err(e) = scheduler.add_realm(realm).await {
            warn!(%principal, error = %e, "skipping persisted realm");
        }
    }

    for realm in configured {
        match scheduler.add_realm(realm.clone()).await {
            Ok(_) => {}
            Err(SchedulerError::Config(ConfigError::DuplicateTarget(_))) => {
                scheduler.update_realm(realm.clone()).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(scheduler.list_realms().await.len())
}
