//! Database backup engine
//!
//! Snapshots a PostgreSQL database, verifies the snapshot, uploads it to
//! S3-compatible storage and rotates old backups.

// dbbackup-engine/src/main.rs
mod backup;
mod config;
mod errors;
mod server;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use backup::BackupTrigger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and run scheduled backups
    Serve,
    /// Run one backup and exit
    Backup {
        /// Mark the backup as manual: exempt from rotation, retention skipped
        #[arg(long)]
        manual: bool,
    },
    /// Apply the retention policy to stored backups
    Retention {
        /// Print what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// List stored backups, newest first
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run_app(Cli::parse()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = Arc::new(
        AppConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?,
    );
    let orchestrator = Arc::new(backup::production_orchestrator(app_config.clone()));

    match cli.command {
        Command::Serve => serve(app_config, orchestrator).await?,
        Command::Backup { manual } => {
            let outcome = orchestrator
                .run_backup(BackupTrigger::from_manual_flag(manual))
                .await
                .context("Backup run failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Retention { dry_run: true } => {
            let plan = orchestrator.plan_retention().await.context("Retention planning failed")?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Retention { dry_run: false } => {
            let report = orchestrator.apply_retention().await.context("Retention pass failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::List => {
            let artifacts = orchestrator.list_artifacts().await.context("Listing backups failed")?;
            println!("{}", serde_json::to_string_pretty(&artifacts)?);
        }
    }
    Ok(())
}

async fn serve(app_config: Arc<AppConfig>, orchestrator: Arc<backup::BackupOrchestrator>) -> Result<()> {
    let cancel = CancellationToken::new();

    let scheduler = app_config.server.schedule_interval.map(|interval| {
        server::scheduler::start_backup_scheduler(orchestrator.clone(), interval, cancel.clone())
    });
    if scheduler.is_none() {
        tracing::info!("No schedule interval configured; backups run only on request");
    }

    let app = server::create_router(server::AppState { orchestrator });
    let addr = &app_config.server.bind_address;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::warn!("Scheduler task ended abnormally: {}", e);
        }
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = cancel.cancelled() => {}
    }
}
