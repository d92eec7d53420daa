//! Sandbox error types.
//!
//! Two families of errors exist:
//!
//! - [`SandboxError`] is returned by the lifecycle API.  Resource breaches and
//!   guest faults are call-fatal and leave the sandbox terminated.
//! - [`FieldError`] is local to a single read/write/delete issued by guest
//!   code.  It is reported through the host log sink and surfaced to the guest
//!   as a failure indicator; the sandbox keeps running.

use std::path::PathBuf;

use sluice_pipeline::ValueKind;

use crate::governor::UsageType;
use crate::sandbox::SandboxStatus;

/// Unified error type for the sandbox lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The interpreter backend could not be allocated.
    #[error("sandbox creation failed: {0}")]
    Creation(String),

    /// The script file is missing, unreadable, or invalid.
    #[error("script load error for {}: {reason}", path.display())]
    ScriptLoad {
        /// Path of the script that failed to load.
        path: PathBuf,
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// A memory, instruction, or output budget was exhausted.
    #[error("{kind} limit exceeded")]
    ResourceLimitExceeded {
        /// Which budget was breached.
        kind: UsageType,
    },

    /// The guest raised an error it did not handle.
    #[error("guest fault: {0}")]
    GuestFault(String),

    /// The call observed a host stop request and was abandoned.
    #[error("sandbox stopped")]
    Stopped,

    /// The requested operation is not valid in the current status.
    #[error("cannot {operation} while sandbox is {status}")]
    State {
        operation: &'static str,
        status: SandboxStatus,
    },

    /// The sandbox configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A persisted state blob could not be decoded or encoded.
    #[error("state format error: {0}")]
    StateFormat(String),

    /// An I/O error occurred (e.g. reading a script or state file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Failure of a single guest-visible field operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    #[error("bad field index {index} for '{name}' ({count} field(s) present)")]
    BadFieldIndex {
        name: String,
        index: i64,
        count: usize,
    },

    #[error("bad array index {index} for '{name}' (array length {len})")]
    BadArrayIndex { name: String, index: i64, len: usize },

    #[error("type error, '{name}' is a {expected} field, got {found}")]
    TypeMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("bad UUID string: {0}")]
    UuidParse(String),

    #[error("can't parse timestamp: {0:?}")]
    TimestampParse(String),

    #[error("can't parse {header} value: {value}")]
    InvalidHeaderValue { header: &'static str, value: String },

    #[error("bad field name: {0}")]
    UnknownField(String),

    #[error("no active pack")]
    NoActivePack,

    /// The guest passed a value the host cannot decode.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
