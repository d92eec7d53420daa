//! Sandbox configuration.
//!
//! [`SandboxConfig`] describes one sandboxed plugin: which script to run,
//! which role it plays in the pipeline, the resource ceilings applied to
//! every call, and the read-only configuration map exposed to the guest
//! through `read_config`.  It deserializes from the `[sandbox]` table of a
//! plugin file and offers a builder-style API for programmatic use.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sluice_pipeline::{GlobalSettings, Value};

use crate::backend::BackendKind;

// ---------------------------------------------------------------------------
// Plugin role
// ---------------------------------------------------------------------------

/// Role of the plugin hosting the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Input,
    Output,
    #[default]
    Filter,
    Decoder,
    Encoder,
}

impl PluginType {
    /// Encoders must not mutate the message other consumers are reading.
    pub fn is_encoder(self) -> bool {
        self == Self::Encoder
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Filter => "filter",
            Self::Decoder => "decoder",
            Self::Encoder => "encoder",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Config values
// ---------------------------------------------------------------------------

/// One entry of the guest-visible configuration map.
///
/// The variant is decided once, when the configuration is loaded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    /// The value as the guest sees it.  Integers are widened to doubles.
    pub fn as_guest(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::Double(*i as f64),
            Self::Float(f) => Value::Double(*f),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for ConfigValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Per-sandbox settings.  Immutable once the sandbox is created.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Plugin name, used as the logger of synthesized messages.
    ///
    /// Default: **"sandbox"**.
    pub name: String,

    /// Script or module to load.  Relative paths resolve against the
    /// daemon's `share_dir`.
    pub script_filename: PathBuf,

    /// `;`-separated module search locations.
    ///
    /// Default: **`<share_dir>/modules`**.
    pub module_directory: Option<String>,

    /// Role of the hosting plugin.
    ///
    /// Default: **filter**.
    pub plugin_type: PluginType,

    /// Peak guest memory allowed, in bytes.
    ///
    /// Default: **8 MiB**.
    pub memory_limit: usize,

    /// Guest operations allowed per call.
    ///
    /// Default: **1 000 000**.
    pub instruction_limit: u64,

    /// Largest single injected payload, in bytes.
    ///
    /// Default: **63 KiB**.
    pub output_limit: usize,

    /// Interpreter backend.  Chosen from the script extension when unset.
    pub backend: Option<BackendKind>,

    /// Guest-visible configuration map.
    pub config: Option<BTreeMap<String, ConfigValue>>,

    #[serde(skip)]
    pub globals: Arc<GlobalSettings>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: "sandbox".to_owned(),
            script_filename: PathBuf::new(),
            module_directory: None,
            plugin_type: PluginType::default(),
            memory_limit: 8 * 1024 * 1024,
            instruction_limit: 1_000_000,
            output_limit: 63 * 1024,
            backend: None,
            config: None,
            globals: Arc::new(GlobalSettings::default()),
        }
    }
}

impl SandboxConfig {
    /// Create a configuration for `script` with default limits.
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script_filename: script.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_plugin_type(mut self, plugin_type: PluginType) -> Self {
        self.plugin_type = plugin_type;
        self
    }

    /// Set the memory ceiling (in bytes).
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Set the per-call instruction budget.
    pub fn with_instruction_limit(mut self, ops: u64) -> Self {
        self.instruction_limit = ops;
        self
    }

    /// Set the largest allowed injected payload (in bytes).
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    pub fn with_module_directory(mut self, dirs: impl Into<String>) -> Self {
        self.module_directory = Some(dirs.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Add one entry to the guest-visible configuration map.
    pub fn with_config_value(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_globals(mut self, globals: Arc<GlobalSettings>) -> Self {
        self.globals = globals;
        self
    }

    /// Script path with relative names resolved against `share_dir`.
    pub fn script_path(&self) -> PathBuf {
        resolve(&self.globals.share_dir, &self.script_filename)
    }

    /// Module search locations in declaration order.
    pub fn module_paths(&self) -> Vec<PathBuf> {
        match &self.module_directory {
            Some(dirs) => dirs
                .split(';')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| resolve(&self.globals.share_dir, Path::new(d)))
                .collect(),
            None => vec![self.globals.share_dir.join("modules")],
        }
    }

    /// Look up a guest-visible configuration entry.
    pub fn config_value(&self, name: &str) -> Option<&ConfigValue> {
        self.config.as_ref()?.get(name)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.memory_limit, 8 * 1024 * 1024);
        assert_eq!(cfg.instruction_limit, 1_000_000);
        assert_eq!(cfg.output_limit, 64_512);
        assert_eq!(cfg.plugin_type, PluginType::Filter);
        assert!(cfg.config.is_none());
        assert!(cfg.backend.is_none());
    }

    #[test]
    fn builder_chaining() {
        let cfg = SandboxConfig::new("counter.rhai")
            .with_plugin_type(PluginType::Encoder)
            .with_memory_limit(1024)
            .with_instruction_limit(500)
            .with_output_limit(128)
            .with_config_value("threshold", 42_i64);
        assert!(cfg.plugin_type.is_encoder());
        assert_eq!(cfg.memory_limit, 1024);
        assert_eq!(cfg.instruction_limit, 500);
        assert_eq!(cfg.output_limit, 128);
        assert_eq!(cfg.config_value("threshold"), Some(&ConfigValue::Integer(42)));
    }

    #[test]
    fn integers_widen_to_double() {
        assert_eq!(ConfigValue::Integer(42).as_guest(), Value::Double(42.0));
        assert_eq!(ConfigValue::Float(0.5).as_guest(), Value::Double(0.5));
        assert_eq!(ConfigValue::Bool(true).as_guest(), Value::Bool(true));
        assert_eq!(
            ConfigValue::from("x").as_guest(),
            Value::String("x".to_owned())
        );
    }

    #[test]
    fn config_kinds_decided_at_load() {
        let cfg: SandboxConfig = toml::from_str(
            r#"
            script_filename = "/opt/scripts/f.rhai"
            plugin_type = "decoder"

            [config]
            threshold = 42
            ratio = 0.25
            enabled = true
            label = "edge"
            "#,
        )
        .expect("parse must succeed in tests");
        assert_eq!(cfg.plugin_type, PluginType::Decoder);
        assert_eq!(cfg.config_value("threshold"), Some(&ConfigValue::Integer(42)));
        assert_eq!(cfg.config_value("ratio"), Some(&ConfigValue::Float(0.25)));
        assert_eq!(cfg.config_value("enabled"), Some(&ConfigValue::Bool(true)));
        assert_eq!(
            cfg.config_value("label"),
            Some(&ConfigValue::String("edge".into()))
        );
        assert!(cfg.config_value("missing").is_none());
    }

    #[test]
    fn module_paths_split_and_resolve() {
        let globals = GlobalSettings::default().with_share_dir("/usr/share/sluice");
        let cfg = SandboxConfig::new("f.rhai")
            .with_globals(Arc::new(globals))
            .with_module_directory("lib; /opt/mods;;");
        assert_eq!(
            cfg.module_paths(),
            vec![
                PathBuf::from("/usr/share/sluice/lib"),
                PathBuf::from("/opt/mods")
            ]
        );
        assert_eq!(cfg.script_path(), PathBuf::from("/usr/share/sluice/f.rhai"));
    }

    #[test]
    fn default_module_path_under_share_dir() {
        let cfg = SandboxConfig::new("/abs/f.rhai");
        assert_eq!(cfg.script_path(), PathBuf::from("/abs/f.rhai"));
        assert_eq!(cfg.module_paths().len(), 1);
    }
}
