//! Sandbox lifecycle.
//!
//! [`Sandbox`] owns one interpreter backend bound to one script and drives
//! it through `create -> init -> (process_message | timer_event)* -> destroy`.
//! Every guest-invoking call gets a fresh [`CallContext`] and is wrapped by
//! the resource governor; a breach or an uncaught guest fault leaves the
//! sandbox terminated for good.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use sluice_pipeline::{Injector, LoggingInjector, Pack, Value};

use crate::backend::{self, Backend, BackendKind, Entry};
use crate::config::SandboxConfig;
use crate::context::CallContext;
use crate::cow::PackLease;
use crate::error::{Result, SandboxError};
use crate::governor::{Abort, Governor, InstructionMeter, StopHandle, UsageStat, UsageType};

/// Lifecycle status reported to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SandboxStatus {
    #[default]
    Unknown,
    Running,
    /// A breach or guest fault ended the sandbox.  Absorbing.
    Terminated,
    /// The host requested a halt.  Absorbing.
    Stopped,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One restricted interpreter bound to one plugin and one script.
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    backend: Box<dyn Backend>,
    meter: Arc<InstructionMeter>,
    governor: Governor,
    status: SandboxStatus,
    last_error: String,
    injector: Arc<dyn Injector>,
}

impl Sandbox {
    /// Allocate the interpreter and register the host protocol.
    pub fn create(config: SandboxConfig) -> Result<Self> {
        if config.script_filename.as_os_str().is_empty() {
            return Err(SandboxError::Config("script_filename is required".into()));
        }
        if config.memory_limit == 0 {
            return Err(SandboxError::Config("memory_limit must be greater than zero".into()));
        }
        let kind = match config.backend {
            Some(kind) => kind,
            None => BackendKind::from_path(&config.script_filename).ok_or_else(|| {
                SandboxError::Config(format!(
                    "cannot infer a backend for {}; set `backend`",
                    config.script_filename.display()
                ))
            })?,
        };

        let config = Arc::new(config);
        let meter = Arc::new(InstructionMeter::new(config.instruction_limit));
        let backend = backend::create(kind, Arc::clone(&config), Arc::clone(&meter))?;
        let governor = Governor::new(config.memory_limit, config.instruction_limit, config.output_limit);

        tracing::info!(
            plugin = %config.name,
            script = %config.script_filename.display(),
            backend = %kind,
            plugin_type = %config.plugin_type,
            "sandbox created"
        );

        Ok(Self {
            config,
            backend,
            meter,
            governor,
            status: SandboxStatus::Unknown,
            last_error: String::new(),
            injector: Arc::new(LoggingInjector),
        })
    }

    /// Load the script, run its top-level code and restore persisted state.
    ///
    /// A missing state file means a fresh start.  On failure the sandbox is
    /// terminated.
    pub fn init(&mut self, state_path: Option<&Path>) -> Result<()> {
        if self.status != SandboxStatus::Unknown {
            return Err(SandboxError::State {
                operation: "initialize",
                status: self.status,
            });
        }

        let script = self.config.script_path();
        let source = match std::fs::read(&script) {
            Ok(source) => source,
            Err(e) => {
                let reason = e.to_string();
                self.terminate(format!("init() {reason}"));
                return Err(SandboxError::ScriptLoad { path: script, reason });
            }
        };
        let state = match state_path.filter(|p| p.exists()) {
            Some(path) => match std::fs::read(path) {
                Ok(blob) => Some(blob),
                Err(e) => {
                    self.terminate(format!("init() cannot read state {}: {e}", path.display()));
                    return Err(SandboxError::Io(e));
                }
            },
            None => None,
        };

        let mut ctx = CallContext::new(None, Arc::clone(&self.injector));
        self.meter.begin();
        let result = self.backend.load(&source, state.as_deref(), &mut ctx);
        self.finish("init", result.map(|()| 0), &ctx)?;

        self.status = SandboxStatus::Running;
        tracing::info!(
            plugin = %self.config.name,
            restored = state.is_some(),
            "sandbox running"
        );
        Ok(())
    }

    /// Run the guest's `process_message` against `pack`.
    pub fn process_message(&mut self, pack: &mut Pack) -> Result<i32> {
        self.ensure_running("process a message")?;
        let lease = PackLease::checkout(pack, self.config.plugin_type.is_encoder());
        let mut ctx = CallContext::new(Some(lease), Arc::clone(&self.injector));
        self.meter.begin();
        let result = self.backend.call(Entry::ProcessMessage, &mut ctx);
        if let Some(lease) = ctx.take_lease() {
            lease.restore(pack);
        }
        self.finish(Entry::ProcessMessage.name(), result, &ctx)
    }

    /// Run the guest's `timer_event` with the current time in nanoseconds.
    pub fn timer_event(&mut self, now_ns: i64) -> Result<i32> {
        self.ensure_running("deliver a timer event")?;
        let mut ctx = CallContext::new(None, Arc::clone(&self.injector));
        self.meter.begin();
        let entry = Entry::TimerEvent(now_ns);
        let result = self.backend.call(entry, &mut ctx);
        self.finish(entry.name(), result, &ctx)
    }

    /// Request a cooperative halt and mark the sandbox stopped.
    pub fn stop(&mut self) {
        self.stop_handle().stop();
        if self.status != SandboxStatus::Terminated {
            self.status = SandboxStatus::Stopped;
        }
        tracing::info!(plugin = %self.config.name, "sandbox stopped");
    }

    /// Handle for requesting a halt from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.meter), self.backend.interrupter())
    }

    /// Tear down, persisting guest state to `state_path` unless terminated.
    pub fn destroy(mut self, state_path: Option<&Path>) -> Result<()> {
        let status = self.status();
        let saved = match state_path {
            Some(path) if matches!(status, SandboxStatus::Running | SandboxStatus::Stopped) => {
                self.save_state(path)
            }
            _ => Ok(false),
        };
        self.backend.teardown();
        tracing::info!(
            plugin = %self.config.name,
            status = %status,
            state_saved = matches!(saved, Ok(true)),
            "sandbox destroyed"
        );
        saved.map(|_| ())
    }

    fn save_state(&mut self, path: &Path) -> Result<bool> {
        let Some(blob) = self.backend.snapshot()? else {
            return Ok(false);
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, blob)?;
        Ok(true)
    }

    pub fn status(&self) -> SandboxStatus {
        if self.status == SandboxStatus::Running && self.meter.stop_requested() {
            SandboxStatus::Stopped
        } else {
            self.status
        }
    }

    /// Description of the failure that ended the sandbox, or empty.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn usage(&self, kind: UsageType, stat: UsageStat) -> u64 {
        self.governor.usage(kind, stat)
    }

    /// Register the callback that receives guest-injected messages.
    pub fn inject_message(&mut self, injector: Arc<dyn Injector>) {
        self.injector = injector;
    }

    /// Read a guest global.
    pub fn guest_global(&mut self, name: &str) -> Option<Value> {
        self.backend.global(name)
    }

    /// Overwrite a guest global.  Returns `false` if it cannot be set.
    pub fn set_guest_global(&mut self, name: &str, value: Value) -> bool {
        self.backend.set_global(name, value)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_running(&mut self, operation: &'static str) -> Result<()> {
        if self.status == SandboxStatus::Running && self.meter.stop_requested() {
            self.status = SandboxStatus::Stopped;
        }
        if self.status != SandboxStatus::Running {
            return Err(SandboxError::State {
                operation,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Record usage and apply the outcome of one guest call.
    fn finish(&mut self, entry: &str, result: std::result::Result<i32, Abort>, ctx: &CallContext) -> Result<i32> {
        let memory = self.backend.memory_in_use() as u64;
        self.governor.record(UsageType::Instruction, self.meter.executed());
        self.governor.record(UsageType::Memory, memory);
        self.governor.record(UsageType::Output, ctx.output_peak() as u64);

        let result = match (ctx.breach(), result) {
            (Some(kind), _) => Err(Abort::Limit(kind)),
            (None, Ok(_)) if self.governor.exceeds(UsageType::Memory, memory) => {
                Err(Abort::Limit(UsageType::Memory))
            }
            (None, result) => result,
        };

        match result {
            Ok(code) => {
                tracing::debug!(plugin = %self.config.name, entry, code, "guest call finished");
                Ok(code)
            }
            Err(Abort::Stopped) => {
                self.status = SandboxStatus::Stopped;
                self.last_error = format!("{entry}() stopped");
                tracing::info!(plugin = %self.config.name, entry, "guest call stopped");
                Err(SandboxError::Stopped)
            }
            Err(Abort::Limit(kind)) => {
                self.terminate(format!("{entry}() {kind}_limit exceeded"));
                Err(SandboxError::ResourceLimitExceeded { kind })
            }
            Err(Abort::Fault(msg)) => {
                self.terminate(format!("{entry}() {msg}"));
                Err(SandboxError::GuestFault(msg))
            }
            Err(Abort::Load(reason)) => {
                self.terminate(format!("{entry}() {reason}"));
                Err(SandboxError::ScriptLoad {
                    path: self.config.script_path(),
                    reason,
                })
            }
        }
    }

    fn terminate(&mut self, error: String) {
        tracing::error!(plugin = %self.config.name, error = %error, "sandbox terminated");
        self.status = SandboxStatus::Terminated;
        self.last_error = error;
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("plugin", &self.config.name)
            .field("backend", &self.backend.kind())
            .field("status", &self.status())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}
