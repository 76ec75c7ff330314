//! chunkup-admin - maintenance for an upload scratch root.
//!
//! Every command first recovers sessions from disk, then acts on them. Run
//! it only while no upload server owns the same scratch root.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunkup_transfer::{TransferConfig, UploadManager, UploadSessionMetadata};

#[derive(Parser, Debug)]
#[command(name = "chunkup-admin")]
#[command(about = "Inspect and maintain chunked upload sessions")]
#[command(version)]
struct Cli {
    /// Config file (JSON); defaults to ~/.config/chunkup/config.json
    #[arg(long, env = "CHUNKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured scratch root
    #[arg(long, env = "CHUNKUP_SCRATCH_ROOT")]
    scratch_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List recovered sessions
    List,
    /// Show one session's record as JSON
    Status { id: String },
    /// Assemble a complete session into its target file
    Finalize { id: String },
    /// Discard a session and its chunks
    Abort { id: String },
    /// Abort sessions idle for longer than the given time
    Reap {
        #[arg(long)]
        max_idle_secs: i64,
        /// Only print what would be aborted
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chunkup=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let (manager, report) =
        UploadManager::open(config).context("failed to open scratch root")?;
    for (dir, reason) in &report.skipped {
        eprintln!("skipped {}: {reason}", dir.display());
    }
    for id in &report.dropped {
        eprintln!("dropped {id}: record missing on disk");
    }

    match cli.command {
        Command::List => {
            for meta in manager.list_sessions() {
                println!("{}", summary_line(&meta));
            }
        }
        Command::Status { id } => {
            let meta = manager.session(&id)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Finalize { id } => {
            let done = manager
                .finalize(&id)
                .with_context(|| format!("failed to finalize {id}"))?;
            println!(
                "{} -> {} ({} bytes, sha256 {})",
                done.id,
                done.target_path.display(),
                done.bytes_written,
                done.checksum
            );
        }
        Command::Abort { id } => {
            if manager.abort_session(&id)? {
                println!("aborted {id}");
            } else {
                println!("no session {id}");
            }
        }
        Command::Reap {
            max_idle_secs,
            dry_run,
        } => {
            for id in reap(&manager, idle_limit(max_idle_secs)?, dry_run)? {
                println!("{} {id}", if dry_run { "would abort" } else { "aborted" });
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<TransferConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(chunkup_transfer::config_file_path);
    let mut config = TransferConfig::load_from(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if let Some(root) = &cli.scratch_root {
        config.scratch_root = root.clone();
    }
    Ok(config)
}

fn idle_limit(secs: i64) -> Result<chrono::TimeDelta> {
    chrono::TimeDelta::try_seconds(secs).context("max idle out of range")
}

/// Aborts (or with `dry_run`, only selects) sessions idle beyond `max_idle`.
fn reap(
    manager: &UploadManager,
    max_idle: chrono::Duration,
    dry_run: bool,
) -> Result<Vec<String>> {
    let stale = manager.stale_sessions(max_idle);
    if dry_run {
        return Ok(stale);
    }

    let mut aborted = Vec::with_capacity(stale.len());
    for id in stale {
        if manager
            .abort_session(&id)
            .with_context(|| format!("failed to abort {id}"))?
        {
            aborted.push(id);
        }
    }
    info!(count = aborted.len(), "reaped stale upload sessions");
    Ok(aborted)
}

fn summary_line(meta: &UploadSessionMetadata) -> String {
    let progress = meta
        .percentage()
        .map(|p| format!("{p:.1}%"))
        .unwrap_or_else(|| format!("{} chunks", meta.received_chunks.len()));
    let updated = meta
        .updated_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    format!(
        "{}\t{}\t{}\t{}\t{}",
        meta.id,
        meta.total_chunks,
        progress,
        updated,
        meta.target_path.display()
    )
}
