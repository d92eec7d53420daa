//! Resource governor.
//!
//! Every guest-invoking call runs under three budgets: memory, instructions
//! and output size.  The [`InstructionMeter`] is the capability each backend
//! wires into its interpreter so that a runaway script is preempted within a
//! bounded number of operations; it also carries the cooperative stop flag.
//! The [`Governor`] keeps the per-kind usage statistics reported through
//! `Sandbox::usage`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// A governed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageType {
    Memory,
    Instruction,
    Output,
}

impl UsageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Instruction => "instruction",
            Self::Output => "output",
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Memory => 0,
            Self::Instruction => 1,
            Self::Output => 2,
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which statistic of a [`UsageType`] to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageStat {
    Limit,
    /// Value observed at the end of the most recent call.
    Current,
    /// Highest value observed over the sandbox's life.
    Maximum,
}

/// Why a guest call was cut short.
#[derive(Debug, Clone, PartialEq)]
pub enum Abort {
    /// A budget was exhausted.
    Limit(UsageType),
    /// The host requested a cooperative stop.
    Stopped,
    /// The guest raised an error it did not handle.
    Fault(String),
    /// The script could not be compiled or instantiated.
    Load(String),
}

// ---------------------------------------------------------------------------
// InstructionMeter
// ---------------------------------------------------------------------------

/// Per-sandbox operation counter and stop flag, shared with the backend.
#[derive(Debug)]
pub struct InstructionMeter {
    limit: u64,
    executed: AtomicU64,
    stop: AtomicBool,
}

impl InstructionMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            executed: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Reset the counter at the start of a call.
    pub fn begin(&self) {
        self.executed.store(0, Ordering::Relaxed);
    }

    /// Report `ops` operations executed so far in this call.
    ///
    /// Returns the reason the guest must be halted, if any.  Backends call
    /// this at least once per guest operation.
    pub fn checkpoint(&self, ops: u64) -> Option<Abort> {
        self.executed.store(ops, Ordering::Relaxed);
        if self.stop_requested() {
            Some(Abort::Stopped)
        } else if ops > self.limit {
            Some(Abort::Limit(UsageType::Instruction))
        } else {
            None
        }
    }

    /// Record an operation count enforced natively by the backend.
    pub fn record(&self, ops: u64) {
        self.executed.store(ops, Ordering::Relaxed);
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// MemoryGauge
// ---------------------------------------------------------------------------

/// Live guest memory sampled while a call runs.
///
/// Backends without an allocator hook walk their live values every
/// [`MemoryGauge::SAMPLE_INTERVAL`] operations and report the total here.
#[derive(Debug)]
pub struct MemoryGauge {
    limit: usize,
    peak: AtomicUsize,
    sampled_at: AtomicU64,
}

impl MemoryGauge {
    pub const SAMPLE_INTERVAL: u64 = 64;

    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            peak: AtomicUsize::new(0),
            sampled_at: AtomicU64::new(0),
        }
    }

    /// Reset the gauge at the start of a call.
    pub fn begin(&self) {
        self.peak.store(0, Ordering::Relaxed);
        self.sampled_at.store(0, Ordering::Relaxed);
    }

    /// Whether a sample is due after `ops` operations.  Claims the sample
    /// when it is.
    pub fn sample_due(&self, ops: u64) -> bool {
        let last = self.sampled_at.load(Ordering::Relaxed);
        if ops.saturating_sub(last) < Self::SAMPLE_INTERVAL {
            return false;
        }
        self.sampled_at.store(ops, Ordering::Relaxed);
        true
    }

    /// Record a sample of `bytes` live; returns the abort once it is over
    /// the limit.
    pub fn observe(&self, bytes: usize) -> Option<Abort> {
        self.peak.fetch_max(bytes, Ordering::Relaxed);
        (bytes > self.limit).then_some(Abort::Limit(UsageType::Memory))
    }

    /// Highest sample taken during the current call.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Wakes a backend that is blocked inside guest code.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// Cross-thread handle that requests a cooperative halt.
///
/// Never blocks; the in-flight call notices the request at its next
/// preemption point.
#[derive(Clone)]
pub struct StopHandle {
    meter: Arc<InstructionMeter>,
    interrupt: Option<Interrupter>,
}

impl StopHandle {
    pub(crate) fn new(meter: Arc<InstructionMeter>, interrupt: Option<Interrupter>) -> Self {
        Self { meter, interrupt }
    }

    pub fn stop(&self) {
        self.meter.request_stop();
        if let Some(interrupt) = &self.interrupt {
            interrupt();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.meter.stop_requested()
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Limits and observed usage for one sandbox.
#[derive(Debug, Clone, Default)]
pub struct Governor {
    limit: [u64; 3],
    current: [u64; 3],
    maximum: [u64; 3],
}

impl Governor {
    pub fn new(memory: usize, instruction: u64, output: usize) -> Self {
        let mut limit = [0; 3];
        limit[UsageType::Memory.slot()] = memory as u64;
        limit[UsageType::Instruction.slot()] = instruction;
        limit[UsageType::Output.slot()] = output as u64;
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn limit(&self, kind: UsageType) -> u64 {
        self.limit[kind.slot()]
    }

    /// Store the value observed at the end of a call.
    pub fn record(&mut self, kind: UsageType, value: u64) {
        let slot = kind.slot();
        self.current[slot] = value;
        self.maximum[slot] = self.maximum[slot].max(value);
    }

    pub fn usage(&self, kind: UsageType, stat: UsageStat) -> u64 {
        let slot = kind.slot();
        match stat {
            UsageStat::Limit => self.limit[slot],
            UsageStat::Current => self.current[slot],
            UsageStat::Maximum => self.maximum[slot],
        }
    }

    pub fn exceeds(&self, kind: UsageType, value: u64) -> bool {
        value > self.limit(kind)
    }
}
