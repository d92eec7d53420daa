//! Message injection.
//!
//! Sandboxes hand synthesized messages back to the pipeline through an
//! [`Injector`].  The sandbox never queues anything itself; it calls the
//! injector unconditionally and lets the host decide.  [`InjectionLimiter`]
//! is the host-side policy wrapper that enforces per-call and re-injection
//! limits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use crate::globals::GlobalSettings;
use crate::message::{Field, Message, Value};

/// `Type` header of messages built by [`synthesize`].
pub const SANDBOX_OUTPUT_TYPE: &str = "sluice.sandbox-output";

/// Result codes returned to guests by an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Accepted = 0,
    /// The per-call injection budget is spent.
    CallLimitExceeded = 1,
    /// The message has already looped through the pipeline too many times.
    LoopLimitExceeded = 2,
    /// The host could not build or deliver the message.
    Failed = 3,
}

impl InjectOutcome {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Host callback receiving guest-synthesized messages.
pub trait Injector: Send + Sync {
    fn inject(&self, payload: &[u8], payload_type: &str, payload_name: &str) -> i32;
}

impl<F> Injector for F
where
    F: Fn(&[u8], &str, &str) -> i32 + Send + Sync,
{
    fn inject(&self, payload: &[u8], payload_type: &str, payload_name: &str) -> i32 {
        self(payload, payload_type, payload_name)
    }
}

/// Injector used until the host registers its own: logs and accepts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInjector;

impl Injector for LoggingInjector {
    fn inject(&self, payload: &[u8], payload_type: &str, payload_name: &str) -> i32 {
        tracing::debug!(
            payload_type,
            payload_name,
            payload_len = payload.len(),
            "injected message discarded (no injector registered)"
        );
        InjectOutcome::Accepted.code()
    }
}

/// Wraps an [`Injector`] with the daemon's loop-prevention policy.
///
/// The host calls [`InjectionLimiter::begin_call`] before every sandbox call
/// to set the budget for that call and the loop count of the message being
/// processed.
pub struct InjectionLimiter {
    inner: Arc<dyn Injector>,
    max_loops: u32,
    budget: AtomicU32,
    injected: AtomicU32,
    loop_count: AtomicU32,
}

impl InjectionLimiter {
    pub fn new(inner: Arc<dyn Injector>, globals: &GlobalSettings) -> Self {
        Self {
            inner,
            max_loops: globals.max_message_loops.max(1),
            budget: AtomicU32::new(globals.max_process_inject),
            injected: AtomicU32::new(0),
            loop_count: AtomicU32::new(0),
        }
    }

    /// Reset the per-call counter.
    pub fn begin_call(&self, budget: u32, msg_loop_count: u32) {
        self.budget.store(budget, Ordering::Relaxed);
        self.loop_count.store(msg_loop_count, Ordering::Relaxed);
        self.injected.store(0, Ordering::Relaxed);
    }

    /// Number of injections accepted since the last [`begin_call`](Self::begin_call).
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::Relaxed)
    }
}

impl Injector for InjectionLimiter {
    fn inject(&self, payload: &[u8], payload_type: &str, payload_name: &str) -> i32 {
        if self.loop_count.load(Ordering::Relaxed) >= self.max_loops {
            tracing::warn!(
                payload_name,
                max_loops = self.max_loops,
                "injection refused: message loop limit reached"
            );
            return InjectOutcome::LoopLimitExceeded.code();
        }
        let budget = self.budget.load(Ordering::Relaxed);
        if self.injected.load(Ordering::Relaxed) >= budget {
            tracing::warn!(payload_name, budget, "injection refused: per-call limit reached");
            return InjectOutcome::CallLimitExceeded.code();
        }
        let code = self.inner.inject(payload, payload_type, payload_name);
        if code == InjectOutcome::Accepted.code() {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        code
    }
}

/// Build the message a host delivers for a guest injection.
pub fn synthesize(
    payload: &[u8],
    payload_type: &str,
    payload_name: &str,
    logger: &str,
    globals: &GlobalSettings,
) -> Message {
    let mut msg = Message::new();
    msg.uuid = Uuid::now_v7();
    msg.timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    msg.msg_type = SANDBOX_OUTPUT_TYPE.to_owned();
    msg.logger = logger.to_owned();
    msg.hostname = globals.hostname.clone();
    msg.pid = std::process::id() as i32;
    msg.payload = String::from_utf8_lossy(payload).into_owned();
    msg.add_field(Field::new("payload_type", Value::String(payload_type.to_owned()), "file-extension"));
    msg.add_field(Field::new("payload_name", Value::String(payload_name.to_owned()), ""));
    msg
}
