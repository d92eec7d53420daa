//! CLI argument definitions for the `sluice` binary.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Sluice -- run a message-processing script inside a governed sandbox.
#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Sluice -- scriptable message sandbox",
    long_about = "Loads a plugin file, runs its script in a resource-governed sandbox and \
                  feeds it JSON-lines messages."
)]
pub struct Cli {
    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Feed messages through the plugin's `process_message`.
    Run {
        /// Plugin file (TOML with `[daemon]` and `[sandbox]` tables).
        config: PathBuf,

        /// JSON-lines input.  Reads stdin when omitted.
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Load guest state from, and save it to, this file.
        #[arg(long, short)]
        state: Option<PathBuf>,

        /// Persist state under the daemon's `base_dir` (ignored with `--state`).
        #[arg(long)]
        preserve: bool,

        /// Deliver `timer_event` every this many seconds, and once at the end.
        #[arg(long)]
        ticker_interval: Option<u64>,

        /// Feed injected messages back through the plugin.
        #[arg(long)]
        reinject: bool,
    },

    /// Load the plugin, run its top-level code and report the result.
    Check {
        /// Plugin file to validate.
        config: PathBuf,
    },
}
