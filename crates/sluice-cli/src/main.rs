//! CLI entry point for Sluice.
//!
//! This binary provides the `sluice` command: `run` feeds JSON-lines
//! messages through a plugin's sandbox, `check` loads a plugin and reports
//! whether it initializes.

mod cli;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use sluice_cli::{PluginFile, RunOptions};
use sluice_sandbox::{Sandbox, SandboxStatus, UsageStat, UsageType};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Run {
            config,
            input,
            state,
            preserve,
            ticker_interval,
            reinject,
        } => {
            let plugin = PluginFile::load(&config)?;
            let state = state.or_else(|| preserve.then(|| plugin.daemon.state_path(&plugin.sandbox.name)));
            let options = RunOptions {
                input,
                state,
                ticker_interval: ticker_interval.map(Duration::from_secs),
                reinject,
            };
            cmd_run(plugin, options).await
        }
        Commands::Check { config } => cmd_check(&config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(plugin: PluginFile, options: RunOptions) -> Result<()> {
    let name = plugin.sandbox.name.clone();
    let summary = sluice_cli::run(plugin, options).await?;
    info!(
        plugin = %name,
        processed = summary.processed,
        rejected = summary.rejected,
        injected = summary.injected,
        timer_events = summary.timer_events,
        status = %summary.status,
        "run finished"
    );
    if summary.status == SandboxStatus::Terminated {
        bail!("plugin {name} terminated: {}", summary.last_error);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check
// ---------------------------------------------------------------------------

fn cmd_check(config: &std::path::Path) -> Result<()> {
    let plugin = PluginFile::load(config)?;
    let mut sandbox = Sandbox::create(plugin.sandbox_config()).context("failed to create sandbox")?;
    sandbox.init(None).context("failed to initialize sandbox")?;

    println!("  plugin:       {}", plugin.sandbox.name);
    println!("  backend:      {}", sandbox.backend_kind());
    println!("  script:       {}", sandbox.config().script_path().display());
    println!(
        "  memory:       {} / {} bytes",
        sandbox.usage(UsageType::Memory, UsageStat::Current),
        sandbox.usage(UsageType::Memory, UsageStat::Limit)
    );
    println!(
        "  instructions: {} / {}",
        sandbox.usage(UsageType::Instruction, UsageStat::Current),
        sandbox.usage(UsageType::Instruction, UsageStat::Limit)
    );
    sandbox.destroy(None)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
