//! overlap-tracer - background daemon that tails coding-agent journals and
//! forwards derived activity events to the configured team instances.
//!
//! State, config, and logs live under `~/.overlap/` (see `overlap-core`'s
//! `paths` module for the full layout). The daemon is single-instance per
//! user, enforced with an advisory file lock.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use overlap_core::paths::ProcessLock;
use overlap_core::{logging, Config, Tracer, TracerOptions};

#[derive(Parser)]
#[command(name = "overlap-tracer")]
#[command(about = "Forward coding-agent activity to your team instances")]
#[command(version)]
struct Args {
    /// Override the agent journal root (default: ~/.claude/projects)
    #[arg(long)]
    journal_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = logging::init().context("failed to initialize logging")?;

    // Single instance per user; a stale sibling simply fails here instead of
    // being hunted down by command line.
    let _lock = ProcessLock::acquire().context("failed to acquire tracer lock")?;

    tracing::info!(teams = config.teams.len(), "overlap-tracer starting");
    if config.teams.is_empty() {
        tracing::warn!("No teams configured; the tracer will idle until config.json lists one");
    }

    let options = TracerOptions {
        journal_root: args.journal_root,
    };
    let mut tracer = Tracer::new(config, options).context("failed to initialize tracer")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime
        .block_on(tracer.run())
        .context("tracer exited with error")?;

    tracing::info!("overlap-tracer stopped");
    Ok(())
}
