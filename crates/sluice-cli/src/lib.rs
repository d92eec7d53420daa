//! Library half of the `sluice` binary.
//!
//! - **[`config`]** -- plugin file loading with `%ENV[...]` substitution.
//! - **[`runner`]** -- the JSON-lines message loop around one sandbox.

pub mod config;
pub mod runner;

pub use config::PluginFile;
pub use runner::{RunOptions, RunSummary, run};
