// ABOUTME: Entry point for the parcelkeep binary.
// ABOUTME: Parses CLI arguments, initializes tracing, opens the persistence engine, and runs one command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parcelkeep_store::{BackupKind, NetworkMonitor};
use parcelkeep_sync::{BackupOutcome, EngineConfig, PersistenceService, SaveOptions, ServiceOptions};

/// Multi-tier persistence for parcel annotations
#[derive(Parser)]
#[command(name = "parcelkeep")]
#[command(about = "Inspect and maintain a parcelkeep data directory", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory (overrides PARCELKEEP_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Treat the remote store as unreachable
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the authoritative dataset and re-sync every tier
    Restore,

    /// Show tier readiness, queue depth, and last save time
    Status,

    /// Replace the dataset with the contents of a JSON file
    Import { file: PathBuf },

    /// Print the current dataset as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List stored snapshots, newest first
    Snapshots,

    /// Delete snapshots past the retention window
    Prune,

    /// Push queued remote writes now
    Drain {
        /// Move dead-lettered items back into the queue first
        #[arg(long)]
        requeue: bool,
    },

    /// Run a daily or monthly backup if one is due
    Backup { kind: BackupKind },

    /// Save the current dataset with a manual snapshot
    Save,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parcelkeep=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().context("invalid PARCELKEEP_* configuration")?;
    if let Some(home) = cli.home {
        config.home = home;
    }
    tracing::debug!(home = %config.home.display(), "parcelkeep starting up");

    let service = PersistenceService::open(
        config,
        ServiceOptions {
            network: NetworkMonitor::new(!cli.offline),
            ..ServiceOptions::default()
        },
    )
    .await
    .context("failed to open persistence engine")?;

    let result = run(&service, cli.command).await;
    service.shutdown().await.context("shutdown failed")?;
    result
}

async fn run(service: &PersistenceService, command: Command) -> Result<()> {
    match command {
        Command::Restore => {
            let outcome = service.restore().await?;
            print_json(&outcome)?;
        }
        Command::Status => print_json(&service.status().await)?,
        Command::Import { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let result = service.import(&raw).await?;
            print_json(&result)?;
        }
        Command::Export { out } => {
            service.restore().await?;
            let json = service.export()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?
                }
                None => println!("{json}"),
            }
        }
        Command::Snapshots => {
            let snapshots = service.coordinator().snapshots().list().await?;
            print_json(&snapshots)?;
        }
        Command::Prune => {
            let removed = service.coordinator().run_cleanup(chrono::Utc::now()).await?;
            println!("removed {removed} snapshot(s)");
        }
        Command::Drain { requeue } => {
            if requeue {
                let moved = service.coordinator().queue().requeue_dead_letters().await?;
                println!("requeued {moved} dead-lettered item(s)");
            }
            match service.coordinator().drain_queue().await? {
                Some(report) => print_json(&report)?,
                None => anyhow::bail!("remote store is not configured or not reachable"),
            }
        }
        Command::Backup { kind } => {
            service.restore().await?;
            match service.run_backup_if_due(kind).await? {
                BackupOutcome::NotDue(last) => {
                    println!("{} backup already completed at {}", kind.as_str(), last.started_at)
                }
                BackupOutcome::Ran(meta) => print_json(&meta)?,
            }
        }
        Command::Save => {
            service.restore().await?;
            let result = service.save_now(SaveOptions::reason("cli").manual()).await?;
            print_json(&result)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcelkeep_core::ParcelRecord;
    use parcelkeep_store::{StorageTier, TierName, keys};

    #[tokio::test]
    async fn status_reads_without_writing() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = PersistenceService::open(
            EngineConfig::for_home(dir.path()),
            ServiceOptions {
                network: NetworkMonitor::new(false),
                ..ServiceOptions::default()
            },
        )
        .await
        .unwrap();
        service.model().upsert(ParcelRecord::new("PNU-1"));
        service.save_now(SaveOptions::default()).await.unwrap();
        let snapshots = service.coordinator().snapshots().list().await.unwrap().len();
        let local = service.coordinator().tier(TierName::Local).unwrap().clone();
        local.clear(keys::MAIN_DATASET).await.unwrap();

        run(&service, Command::Status).await.unwrap();

        assert_eq!(service.coordinator().snapshots().list().await.unwrap().len(), snapshots);
        assert!(local.read(keys::MAIN_DATASET).await.unwrap().is_none());
        service.shutdown().await.unwrap();
    }
}
