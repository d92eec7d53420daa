//! Per-call context.
//!
//! A [`CallContext`] is built by the sandbox for every guest-invoking call
//! and handed to the backend, which makes it reachable from its host
//! functions for the duration of the call.  It owns the checked-out pack
//! lease, the field-iteration cursor and the injector.  Every guest protocol
//! operation is implemented here once and shared by both backends.

use std::borrow::Cow;
use std::sync::Arc;

use sluice_pipeline::{Injector, LoggingInjector, Value, ValueRef};

use crate::address::Target;
use crate::bridge::{self, FieldSummary};
use crate::config::SandboxConfig;
use crate::cow::PackLease;
use crate::error::FieldError;
use crate::governor::UsageType;

#[derive(Default)]
pub struct CallContext {
    lease: Option<PackLease>,
    cursor: usize,
    injector: Option<Arc<dyn Injector>>,
    output_peak: usize,
    breach: Option<UsageType>,
}

impl CallContext {
    pub fn new(lease: Option<PackLease>, injector: Arc<dyn Injector>) -> Self {
        Self {
            lease,
            injector: Some(injector),
            ..Self::default()
        }
    }

    pub fn take_lease(&mut self) -> Option<PackLease> {
        self.lease.take()
    }

    /// Budget breached by a host function during this call.
    pub fn breach(&self) -> Option<UsageType> {
        self.breach
    }

    /// Largest payload injected during this call.
    pub fn output_peak(&self) -> usize {
        self.output_peak
    }

    // -----------------------------------------------------------------------
    // Guest protocol
    // -----------------------------------------------------------------------

    /// Resolve `token` and read the addressed value.
    ///
    /// Returns `None` for unknown names, out-of-range indices, or when no
    /// pack is checked out.
    pub fn read_message(&self, token: &str, fi: i64, ai: i64) -> Option<ValueRef<'_>> {
        let lease = self.lease.as_ref()?;
        match Target::resolve(token) {
            Target::Header(header) => Some(bridge::read_header(lease.message(), header)),
            Target::Field(name) => bridge::read_field(lease.message(), name, fi, ai),
            Target::Raw => lease.raw().map(|b| ValueRef::Bytes(Cow::Borrowed(b))),
            Target::Unknown(_) => None,
        }
    }

    /// Write a header or field.  Failures are reported through the log
    /// sink and returned as `false`.
    pub fn write_message(
        &mut self,
        config: &SandboxConfig,
        token: &str,
        value: Value,
        rep: &str,
        fi: i64,
        ai: i64,
    ) -> bool {
        let result = self.try_write(token, value, rep, fi, ai);
        settle(config, "write_message", result)
    }

    fn try_write(&mut self, token: &str, value: Value, rep: &str, fi: i64, ai: i64) -> Result<(), FieldError> {
        let msg = self.lease.as_mut().ok_or(FieldError::NoActivePack)?.message_mut();
        match Target::resolve(token) {
            Target::Header(header) => bridge::write_header(msg, header, value),
            Target::Field(name) => bridge::write_field(msg, name, value, rep, fi, ai),
            Target::Raw | Target::Unknown(_) => Err(FieldError::UnknownField(token.to_owned())),
        }
    }

    /// Delete a field or one element of it.
    pub fn delete_field(&mut self, config: &SandboxConfig, token: &str, fi: i64, ai: Option<i64>) -> bool {
        let result = self.try_delete(token, fi, ai);
        settle(config, "delete_field", result)
    }

    fn try_delete(&mut self, token: &str, fi: i64, ai: Option<i64>) -> Result<(), FieldError> {
        let msg = self.lease.as_mut().ok_or(FieldError::NoActivePack)?.message_mut();
        match Target::resolve(token) {
            Target::Field(name) => bridge::delete_field(msg, name, fi, ai),
            _ => Err(FieldError::UnknownField(token.to_owned())),
        }
    }

    /// Return the next field and advance the cursor.
    pub fn read_next_field(&mut self) -> Option<FieldSummary<'_>> {
        let lease = self.lease.as_ref()?;
        let summary = bridge::next_field(lease.message(), self.cursor)?;
        self.cursor += 1;
        Some(summary)
    }

    /// Return the next field without advancing the cursor.
    pub fn peek_next_field(&self) -> Option<FieldSummary<'_>> {
        bridge::next_field(self.lease.as_ref()?.message(), self.cursor)
    }

    pub fn advance_field_cursor(&mut self) {
        self.cursor += 1;
    }

    /// Look up a configuration entry, integers widened to doubles.
    pub fn read_config(&self, config: &SandboxConfig, name: &str) -> Option<Value> {
        config.config_value(name).map(|v| v.as_guest())
    }

    /// Hand a payload to the injector.
    ///
    /// A payload larger than `output_limit` is a breach: the call must be
    /// aborted and the injector is not invoked.
    pub fn inject_message(
        &mut self,
        config: &SandboxConfig,
        payload: &[u8],
        payload_type: &str,
        payload_name: &str,
    ) -> Result<i32, UsageType> {
        self.output_peak = self.output_peak.max(payload.len());
        if payload.len() > config.output_limit {
            self.breach = Some(UsageType::Output);
            return Err(UsageType::Output);
        }
        let code = match &self.injector {
            Some(injector) => injector.inject(payload, payload_type, payload_name),
            None => LoggingInjector.inject(payload, payload_type, payload_name),
        };
        Ok(code)
    }
}

/// Report a failed field operation through the log sink.
pub fn report(config: &SandboxConfig, component: &str, err: &FieldError) {
    config.globals.log_message(component, &err.to_string());
}

fn settle(config: &SandboxConfig, component: &str, result: Result<(), FieldError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            report(config, component, &err);
            false
        }
    }
}
