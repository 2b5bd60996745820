//! wardend — warden service registry daemon
//!
//! Serves the discovery HTTP API, runs the background health checker, and
//! drives failover/failback for registered service endpoints.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::{StoreBackend, WardenConfig};
use warden_api::{Discovery, http::create_router};
use warden_failover::FailoverManager;
use warden_health::{HealthChecker, HttpProber, ProbeSink, Prober};
use warden_store::{MemoryStore, RegistryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "warden service registry daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry daemon (serve the API and the health loop)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/wardend/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/wardend/config.json")]
        output: PathBuf,
    },

    /// Validate a config file and check store connectivity
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/wardend/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("wardend=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_daemon(config).await,
        Commands::InitConfig { output } => init_config(output),
        Commands::Check { config } => check_config(config).await,
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting wardend");

    let config = WardenConfig::load(&config_path)?;
    info!(
        bind = %config.bind_addr,
        interval_secs = config.health_check_interval_secs,
        failure_threshold = config.failure_threshold,
        "loaded config"
    );

    let store = build_store(&config)?;
    let failover = Arc::new(FailoverManager::new(
        Arc::clone(&store),
        config.failover_policy(),
    ));
    // Stability counters are derived state; rebuild them from the health
    // log instead of assuming in-memory continuity across restarts.
    failover.rebuild_stability().await?;

    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new()?);
    let checker = Arc::new(HealthChecker::new(
        Arc::clone(&store),
        prober,
        Arc::clone(&failover) as Arc<dyn ProbeSink>,
        config.health_config(),
    ));

    let discovery = Arc::new(Discovery::new(
        Arc::clone(&store),
        failover,
        Arc::clone(&checker),
        config.api_policy(),
    ));

    let cancel = CancellationToken::new();
    let health_task = {
        let checker = Arc::clone(&checker);
        let cancel = cancel.clone();
        tokio::spawn(async move { checker.run(cancel).await })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let router = create_router(discovery);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "discovery API listening");

    let serve_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
        .await?;

    // The health checker drains its in-flight round before exiting.
    if let Err(e) = health_task.await {
        error!(error = %e, "health loop task failed");
    }
    info!("wardend stopped");
    Ok(())
}

fn build_store(config: &WardenConfig) -> anyhow::Result<Arc<dyn RegistryStore>> {
    Ok(match &config.store {
        StoreBackend::Sqlite { path } => {
            info!(path = %path.display(), "opening sqlite registry store");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteStore::open(path)?)
        }
        StoreBackend::Memory => {
            info!("using in-memory registry store");
            Arc::new(MemoryStore::new())
        }
    })
}

// ─── InitConfig ──────────────────────────────────────────────────────────────

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = WardenConfig::default();
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to set the store path and bind address, then run:");
    println!("  wardend run --config {}", output.display());
    Ok(())
}

// ─── Check ───────────────────────────────────────────────────────────────────

async fn check_config(config_path: PathBuf) -> anyhow::Result<()> {
    let config = WardenConfig::load(&config_path)?;
    let store = build_store(&config)?;
    let endpoints = store.live_endpoints().await?;

    println!("Config OK: {}", config_path.display());
    println!("  bind:            {}", config.bind_addr);
    println!("  check interval:  {}s", config.health_check_interval_secs);
    println!("  probe timeout:   {}s", config.health_check_timeout_secs);
    println!("  live endpoints:  {}", endpoints.len());
    Ok(())
}
