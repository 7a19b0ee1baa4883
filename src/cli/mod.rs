//! Command-line interface for chanwatch.
//!
//! Provides commands for running monitors, inspecting their checkpoints,
//! forcing an epoch rotation and showing the resolved configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::adapters::Adapters;
use crate::config::{self, MonitorConfig, ResolvedConfig};
use crate::core::{
    shutdown_channel, CheckpointStore, CycleReport, JsonlCheckpointStore, Orchestrator, Shutdown,
    SystemClock,
};

/// chanwatch - resumable channel monitor
#[derive(Parser, Debug)]
#[command(name = "chanwatch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run monitors until interrupted
    Run {
        /// Monitor to run (repeatable; all configured monitors if omitted)
        #[arg(short, long = "monitor")]
        monitors: Vec<String>,

        /// Run a single cycle per monitor and exit
        #[arg(long)]
        once: bool,
    },

    /// Show checkpoint state of monitors
    Status {
        /// Monitor name (all if omitted)
        name: Option<String>,
    },

    /// Start a new epoch for a monitor now
    Rotate {
        /// Monitor name
        name: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { monitors, once } => run_monitors(&monitors, once).await,
            Commands::Status { name } => show_status(name.as_deref()).await,
            Commands::Rotate { name } => rotate_monitor(&name).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Open a monitor's checkpoint and wire its adapters
async fn build_orchestrator(cfg: &ResolvedConfig, monitor: &MonitorConfig) -> Result<Orchestrator> {
    let store = JsonlCheckpointStore::open_at(&cfg.monitors_dir(), &monitor.name)
        .await
        .with_context(|| format!("Failed to open checkpoint for monitor '{}'", monitor.name))?;
    let adapters = Adapters::from_config(monitor)
        .with_context(|| format!("Failed to set up adapters for monitor '{}'", monitor.name))?;

    Orchestrator::resume(
        monitor.settings(),
        adapters,
        Arc::new(store),
        Arc::new(SystemClock),
    )
    .await
}

/// Run the selected monitors concurrently
async fn run_monitors(names: &[String], once: bool) -> Result<()> {
    let cfg = config::config()?;
    let selected = cfg.select(names)?;
    if selected.is_empty() {
        anyhow::bail!("No monitors configured. Add one under `monitors:` in .chanwatch/config.yaml");
    }

    let mut orchestrators = Vec::with_capacity(selected.len());
    for monitor in selected {
        orchestrators.push(build_orchestrator(cfg, monitor).await?);
    }

    if once {
        let mut reports = Vec::with_capacity(orchestrators.len());
        for mut orchestrator in orchestrators {
            let report = orchestrator.run_cycle(&Shutdown::never()).await;
            eprintln!(
                "[{}] delivered {}, suppressed {}, failed {}, abandoned {}{}",
                orchestrator.settings().name,
                report.delivered,
                report.suppressed,
                report.failed,
                report.abandoned,
                if report.rotated { ", rotated" } else { "" }
            );
            reports.push((orchestrator.settings().name.clone(), report));
        }
        return check_reports(&reports);
    }

    let (trigger, shutdown) = shutdown_channel();

    let mut handles = Vec::with_capacity(orchestrators.len());
    for mut orchestrator in orchestrators {
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.run(shutdown).await;
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown requested, finishing in-flight work");
    trigger.trigger();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Monitor task panicked");
        }
    }

    Ok(())
}

/// Fail when any single-cycle run reported a failure
fn check_reports(reports: &[(String, CycleReport)]) -> Result<()> {
    let failed: Vec<&str> = reports
        .iter()
        .filter(|(_, report)| !report.failures.is_empty())
        .map(|(name, _)| name.as_str())
        .collect();
    if !failed.is_empty() {
        anyhow::bail!("Cycle reported failures for: {}", failed.join(", "));
    }
    Ok(())
}

/// Show checkpoint state without taking the monitor lock
async fn show_status(name: Option<&str>) -> Result<()> {
    let cfg = config::config()?;
    let names: Vec<String> = match name {
        Some(n) => vec![n.to_string()],
        None => cfg.monitors.iter().map(|m| m.name.clone()).collect(),
    };

    if names.is_empty() {
        println!("No monitors configured");
        return Ok(());
    }

    let root = cfg.monitors_dir();
    for name in names {
        println!("Monitor: {}", name);
        let Some(state) = JsonlCheckpointStore::peek(&root, &name).await? else {
            println!("  (no checkpoint yet)\n");
            continue;
        };

        println!("  Tracking:    {:?}", state.tracker.mode());
        println!("  Epoch start: {}", state.epoch_start);
        println!("  Sources:     {}", state.sources.len());
        for (source, summary) in state.tracker.describe() {
            println!("    {:<30} {}", source, summary);
        }
        if !state.failures.is_empty() {
            println!("  Pending failures:");
            for record in state.failures.entries() {
                println!(
                    "    {} #{}: {} failure(s), last: {}",
                    record.source, record.item_id, record.count, record.last_error
                );
            }
        }
        println!();
    }

    Ok(())
}

/// Rotate a monitor's checkpoint immediately
async fn rotate_monitor(name: &str) -> Result<()> {
    let cfg = config::config()?;
    if cfg.monitor(name).is_none() {
        anyhow::bail!("Unknown monitor: {}", name);
    }

    let store = JsonlCheckpointStore::open(name)
        .await
        .with_context(|| format!("Failed to open checkpoint for monitor '{}'", name))?;
    let Some(state) = store.resume().await? else {
        anyhow::bail!("Monitor '{}' has no checkpoint yet", name);
    };

    let next = state.rotated(Utc::now());
    store.rotate(&next).await?;

    println!("Rotated '{}': epoch {} -> {}", name, state.epoch_start, next.epoch_start);
    Ok(())
}

/// Show the resolved configuration (for debugging)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("chanwatch configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Checkpoints: {}", cfg.monitors_dir().display());
    println!();
    println!("Monitors:");
    if cfg.monitors.is_empty() {
        println!("  (none)");
    }
    for monitor in &cfg.monitors {
        let settings = monitor.settings();
        println!("  {}", monitor.name);
        println!("    Tracking: {:?}", monitor.tracking);
        println!("    Sources:  {}", monitor.sources.len());
        println!("    Interval: {}s", settings.interval.as_secs());
        println!("    Epoch:    {}s", settings.epoch_length.as_secs());
        match settings.max_item_failures {
            Some(max) => println!("    Dead-letter after: {} failing cycles", max),
            None => println!("    Dead-letter after: never"),
        }
    }

    Ok(())
}
