//! Host-wide settings shared by every plugin.
//!
//! [`GlobalSettings`] mirrors the `[daemon]` table of the configuration file
//! and also carries the [`LogSink`] through which sandboxes report
//! recoverable errors.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

/// Receives `(component, message)` pairs for recoverable-error reporting.
pub trait LogSink: Send + Sync {
    fn log_message(&self, component: &str, message: &str);
}

/// Default sink: forwards every report as a `tracing` warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log_message(&self, component: &str, message: &str) {
        tracing::warn!(component, "{message}");
    }
}

/// Daemon-wide settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Hostname stamped into synthesized messages.
    pub hostname: String,

    /// Maximum number of times a message may be re-injected.
    ///
    /// Default: **4**.
    pub max_message_loops: u32,

    /// Maximum injections from a single `process_message` call.
    ///
    /// Default: **1**.
    pub max_process_inject: u32,

    /// Maximum injections from a single `timer_event` call.
    ///
    /// Default: **10**.
    pub max_timer_inject: u32,

    /// Writable directory for persisted sandbox state.
    pub base_dir: PathBuf,

    /// Read-only directory for shared scripts and modules.
    pub share_dir: PathBuf,

    #[serde(skip, default = "default_sink")]
    sink: Arc<dyn LogSink>,
}

fn default_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingLogSink)
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            hostname: local_hostname(),
            max_message_loops: 4,
            max_process_inject: 1,
            max_timer_inject: 10,
            base_dir: PathBuf::from("."),
            share_dir: PathBuf::from("."),
            sink: default_sink(),
        }
    }
}

impl fmt::Debug for GlobalSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalSettings")
            .field("hostname", &self.hostname)
            .field("max_message_loops", &self.max_message_loops)
            .field("max_process_inject", &self.max_process_inject)
            .field("max_timer_inject", &self.max_timer_inject)
            .field("base_dir", &self.base_dir)
            .field("share_dir", &self.share_dir)
            .finish_non_exhaustive()
    }
}

impl GlobalSettings {
    /// Replace the log sink.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_share_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.share_dir = dir.into();
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Default location of the persisted state for the plugin `name`.
    pub fn state_path(&self, name: &str) -> PathBuf {
        self.base_dir
            .join("sandbox_preservation")
            .join(format!("{name}.data"))
    }

    /// Report a recoverable error on behalf of `component`.
    pub fn log_message(&self, component: &str, message: &str) {
        self.sink.log_message(component, message);
    }
}

/// Best-effort local hostname without pulling in platform bindings.
fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_owned();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
