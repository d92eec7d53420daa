//! Interpreter backend adapters.
//!
//! A [`Backend`] is the minimal glue between the engine-agnostic sandbox
//! core and one interpreter: load a script, call a named entry point with a
//! per-call [`CallContext`], fetch or set a guest global, snapshot state and
//! tear down.  Field-protocol semantics live in the core, never here.

pub mod rhai;
pub mod wasm;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use sluice_pipeline::Value;

use crate::config::SandboxConfig;
use crate::context::CallContext;
use crate::error::{Result, SandboxError};
use crate::governor::{Abort, InstructionMeter, Interrupter};

/// Available interpreter backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Rhai,
    Wasm,
}

impl BackendKind {
    /// Infer the backend from a script's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "rhai" => Some(Self::Rhai),
            "wasm" | "wat" => Some(Self::Wasm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rhai => "rhai",
            Self::Wasm => "wasm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guest entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    ProcessMessage,
    /// Carries the current time in nanoseconds since the epoch.
    TimerEvent(i64),
}

impl Entry {
    pub fn name(self) -> &'static str {
        match self {
            Self::ProcessMessage => "process_message",
            Self::TimerEvent(_) => "timer_event",
        }
    }
}

pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Compile the script, run its top-level code and restore `state`.
    fn load(&mut self, source: &[u8], state: Option<&[u8]>, ctx: &mut CallContext) -> std::result::Result<(), Abort>;

    /// Invoke a guest entry point.  `ctx` must be handed back intact.
    fn call(&mut self, entry: Entry, ctx: &mut CallContext) -> std::result::Result<i32, Abort>;

    fn global(&mut self, name: &str) -> Option<Value>;

    /// Returns `false` if the global does not exist or cannot hold `value`.
    fn set_global(&mut self, name: &str, value: Value) -> bool;

    /// Opaque blob persisted between runs, if the guest has any state.
    fn snapshot(&mut self) -> Result<Option<Vec<u8>>>;

    /// Bytes of guest memory in use: the live size for backends that can
    /// measure it, otherwise the peak sampled during the last call.
    fn memory_in_use(&mut self) -> usize;

    /// Hook that breaks a blocked guest out of its current call.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }

    fn teardown(&mut self) {}
}

/// Allocate the interpreter for `kind`.
pub fn create(
    kind: BackendKind,
    config: Arc<SandboxConfig>,
    meter: Arc<InstructionMeter>,
) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Rhai => Box::new(rhai::RhaiBackend::new(config, meter)),
        BackendKind::Wasm => Box::new(
            wasm::WasmBackend::new(config, meter).map_err(|e| SandboxError::Creation(e.to_string()))?,
        ),
    };
    Ok(backend)
}
