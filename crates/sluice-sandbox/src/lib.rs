//! Sluice script sandbox.
//!
//! Runs operator-supplied scripts in the hot path of a message pipeline
//! under a narrow, resource-governed protocol.  Two interpreter backends
//! satisfy the same contract: Rhai scripts and WebAssembly modules.
//!
//! # Architecture
//!
//! - **[`sandbox`]** -- [`Sandbox`], the lifecycle manager the host drives.
//! - **[`address`]** -- resolves guest tokens (`Type`, `Fields[name]`, `raw`).
//! - **[`bridge`]** -- typed reads, writes and deletes against a message.
//! - **[`cow`]** -- [`PackLease`], the copy-on-write guard for encoders.
//! - **[`governor`]** -- memory / instruction / output budgets and stop.
//! - **[`context`]** -- the per-call context every host function works on.
//! - **[`backend`]** -- the adapter trait and the Rhai / wasm backends.
//! - **[`config`]** -- [`SandboxConfig`] and guest-visible config values.
//! - **[`error`]** -- [`SandboxError`] and [`FieldError`].

pub mod address;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod context;
pub mod cow;
pub mod error;
pub mod governor;
pub mod sandbox;

pub use backend::{Backend, BackendKind, Entry};
pub use config::{ConfigValue, PluginType, SandboxConfig};
pub use context::CallContext;
pub use cow::PackLease;
pub use error::{FieldError, Result, SandboxError};
pub use governor::{StopHandle, UsageStat, UsageType};
pub use sandbox::{Sandbox, SandboxStatus};
