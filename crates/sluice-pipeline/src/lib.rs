//! Sluice pipeline collaborators.
//!
//! The types in this crate belong to the host pipeline rather than to the
//! script sandbox; the sandbox borrows them for the duration of one call.
//!
//! - **[`message`]** -- [`Message`], [`Field`], and the [`Value`] /
//!   [`ValueRef`] exchange types.
//! - **[`pack`]** -- [`Pack`], the container that carries a message through
//!   the pipeline together with its encoded bytes.
//! - **[`globals`]** -- [`GlobalSettings`] and the [`LogSink`] used for
//!   recoverable-error reporting.
//! - **[`inject`]** -- the [`Injector`] callback and the host-side
//!   [`InjectionLimiter`].

pub mod globals;
pub mod inject;
pub mod message;
pub mod pack;

pub use globals::{GlobalSettings, LogSink, TracingLogSink};
pub use inject::{InjectOutcome, InjectionLimiter, Injector, LoggingInjector};
pub use message::{
    DEFAULT_SEVERITY, Field, FieldValues, Message, Value, ValueKind, ValueRef,
};
pub use pack::Pack;
