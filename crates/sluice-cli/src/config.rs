//! Plugin file loading.
//!
//! A plugin file is TOML with a `[daemon]` table (host-wide
//! [`GlobalSettings`]) and a `[sandbox]` table ([`SandboxConfig`], with the
//! guest-visible `[sandbox.config]` sub-table).  `%ENV[NAME]` occurrences
//! anywhere in the file are replaced with the named environment variable
//! before parsing; a `.env` file in the working directory is honoured.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};
use serde::Deserialize;
use sluice_pipeline::GlobalSettings;
use sluice_sandbox::SandboxConfig;

const ENV_REFERENCE: &str = r"%ENV\[([A-Za-z_][A-Za-z0-9_]*)\]";

/// A parsed plugin file.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginFile {
    #[serde(default)]
    pub daemon: GlobalSettings,
    pub sandbox: SandboxConfig,
}

impl PluginFile {
    /// Read, substitute and parse the plugin file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plugin file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid plugin file {}", path.display()))
    }

    /// Parse plugin TOML after `%ENV[...]` substitution.
    pub fn parse(raw: &str) -> Result<Self> {
        let text = substitute_env(raw, |name| std::env::var(name).ok())?;
        let mut file: PluginFile = toml::from_str(&text).context("failed to parse TOML")?;
        file.sandbox.globals = Arc::new(file.daemon.clone());
        Ok(file)
    }

    /// The sandbox configuration, bound to the daemon settings.
    pub fn sandbox_config(&self) -> SandboxConfig {
        self.sandbox.clone()
    }
}

/// Replace every `%ENV[NAME]` with `lookup(NAME)`.  Unset variables are an
/// error.
pub fn substitute_env(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let pattern = Regex::new(ENV_REFERENCE).context("invalid %ENV pattern")?;
    let mut missing = Vec::new();
    let text = pattern.replace_all(raw, |caps: &Captures<'_>| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            missing.push(name.to_owned());
            String::new()
        })
    });
    if !missing.is_empty() {
        bail!("environment variables not set: {}", missing.join(", "));
    }
    Ok(text.into_owned())
}
