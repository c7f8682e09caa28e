//! Platform Backup - Main entry point
//!
//! `platform-backup backup` captures every instance in the cluster,
//! `platform-backup restore` brings one archive back into its namespace.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use platform_backup::backup::run_backup;
use platform_backup::cluster::k8s::KubeClusterClient;
use platform_backup::config::Config;
use platform_backup::restore::{RestoreCoordinator, RestoreRequest};
use platform_backup::storage::s3::S3ObjectStore;
use platform_backup::utils;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Local working directory (overrides config and WORK_DIR)
    #[arg(short, long, value_name = "DIR", global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every platform instance found in the cluster
    Backup,

    /// Restore one archive into its instance namespace
    Restore {
        /// Target instance (namespace and bucket)
        #[arg(long, env = "INSTANCE_NAME")]
        instance: Option<String>,

        /// Archive key inside the instance bucket
        #[arg(long, env = "BACKUP_ARCHIVE")]
        archive: Option<String>,

        /// Restore a bundle with failed components, skipping those components
        #[arg(long)]
        allow_partial: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(dir) = args.work_dir {
        config.backup.work_dir = dir;
    }
    if let Command::Restore {
        instance,
        archive,
        allow_partial,
    } = &args.command
    {
        if instance.is_some() {
            config.restore.instance = instance.clone();
        }
        if archive.is_some() {
            config.restore.archive = archive.clone();
        }
        config.restore.allow_partial |= *allow_partial;
    }

    // Initialize logging
    utils::logger::init(&config.log.level)?;

    tracing::info!("Starting platform-backup v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Backup => backup(config).await,
        Command::Restore { .. } => restore(config).await,
    }
}

async fn backup(config: Config) -> Result<()> {
    config.validate_backup()?;

    let cluster = KubeClusterClient::try_default().await?;
    let store = S3ObjectStore::new(&config.storage).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let report = run_backup(&cluster, &store, &config, &cancel).await?;

    for failed in report.failed() {
        tracing::error!(
            instance = %failed.instance,
            error = failed.error.as_deref().unwrap_or("incomplete"),
            "Instance backup failed"
        );
    }

    let failed = report.failed().len();
    if failed > 0 || !report.skipped.is_empty() {
        bail!(
            "{} of {} instance backups failed, {} skipped",
            failed,
            report.instances.len(),
            report.skipped.len()
        );
    }
    Ok(())
}

async fn restore(config: Config) -> Result<()> {
    let request = RestoreRequest::from_config(&config)?;

    let cluster = KubeClusterClient::try_default().await?;
    let store = S3ObjectStore::new(&config.storage).await?;

    match RestoreCoordinator::new(&cluster, &store, &config)
        .run(&request)
        .await
    {
        Ok(report) => {
            tracing::info!(
                instance = %report.instance,
                archive = %report.archive,
                "Restore complete"
            );
            Ok(())
        }
        Err(failure) => {
            tracing::error!("{}", failure);
            Err(failure.into())
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Cannot listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, finishing the current instance"),
        _ = terminate => tracing::info!("Received SIGTERM, finishing the current instance"),
    }

    cancel.cancel();
}
