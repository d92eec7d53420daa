//! WebAssembly backend.
//!
//! Modules (binary `.wasm` or text `.wat`) export `memory` plus
//! `process_message() -> i32` and/or `timer_event(i64) -> i32`, and import
//! the host protocol from module `env`.  Every pointer argument refers to
//! the exported linear memory; an out-of-bounds pointer traps.
//!
//! Governance is native: fuel metering bounds instructions, a store
//! resource limiter bounds memory growth, and epoch interruption lets a
//! [`StopHandle`](crate::governor::StopHandle) break an in-flight call.

use std::borrow::Cow;
use std::sync::Arc;

use sluice_pipeline::{Value, ValueKind, ValueRef};
use wasmtime::{
    Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, ResourceLimiter, Store, Trap,
    Val,
};

use super::{Backend, BackendKind, Entry};
use crate::config::SandboxConfig;
use crate::context::{self, CallContext};
use crate::error::{FieldError, Result, SandboxError};
use crate::governor::{Abort, InstructionMeter, Interrupter, UsageType};

const WASM_PAGE: usize = 64 * 1024;

/// Caps linear-memory growth at the sandbox's memory limit.
struct MemoryLimiter {
    limit: usize,
    peak: usize,
    breached: bool,
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(&mut self, _current: usize, desired: usize, _maximum: Option<usize>) -> wasmtime::Result<bool> {
        if desired > self.limit {
            self.breached = true;
            return Err(wasmtime::Error::msg(format!(
                "memory limit of {} bytes exceeded ({desired} requested)",
                self.limit
            )));
        }
        self.peak = self.peak.max(desired);
        Ok(true)
    }

    fn table_growing(&mut self, _current: usize, desired: usize, _maximum: Option<usize>) -> wasmtime::Result<bool> {
        Ok(desired <= 10_000)
    }
}

/// Data attached to the wasmtime [`Store`].
struct HostState {
    ctx: CallContext,
    config: Arc<SandboxConfig>,
    memory: MemoryLimiter,
}

pub struct WasmBackend {
    engine: Engine,
    config: Arc<SandboxConfig>,
    meter: Arc<InstructionMeter>,
    linker: Linker<HostState>,
    store: Store<HostState>,
    instance: Option<Instance>,
}

impl WasmBackend {
    pub fn new(config: Arc<SandboxConfig>, meter: Arc<InstructionMeter>) -> wasmtime::Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.epoch_interruption(true);
        wasm_config.wasm_memory64(false);
        let engine = Engine::new(&wasm_config)?;

        let mut linker = Linker::new(&engine);
        define_host_functions(&mut linker)?;

        let state = HostState {
            ctx: CallContext::default(),
            config: Arc::clone(&config),
            memory: MemoryLimiter {
                limit: config.memory_limit,
                peak: 0,
                breached: false,
            },
        };
        let mut store = Store::new(&engine, state);
        store.limiter(|s| &mut s.memory);

        Ok(Self {
            engine,
            config,
            meter,
            linker,
            store,
            instance: None,
        })
    }

    /// Arm fuel and the epoch deadline for one guest entry.
    fn arm(&mut self) -> std::result::Result<(), Abort> {
        self.store
            .set_fuel(self.meter.limit())
            .map_err(|e| Abort::Fault(e.to_string()))?;
        self.store.set_epoch_deadline(1);
        self.store.data_mut().memory.breached = false;
        if self.meter.stop_requested() {
            return Err(Abort::Stopped);
        }
        Ok(())
    }

    /// Record fuel spent since [`arm`](Self::arm).
    fn settle_fuel(&mut self) {
        let remaining = self.store.get_fuel().unwrap_or_default();
        self.meter.record(self.meter.limit().saturating_sub(remaining));
    }

    fn classify(&self, err: wasmtime::Error) -> Abort {
        if self.store.data().memory.breached {
            return Abort::Limit(UsageType::Memory);
        }
        if let Some(kind) = self.store.data().ctx.breach() {
            return Abort::Limit(kind);
        }
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => Abort::Limit(UsageType::Instruction),
            Some(Trap::Interrupt) => Abort::Stopped,
            _ => Abort::Fault(format!("{err:#}")),
        }
    }

    fn memory(&mut self) -> Option<Memory> {
        let instance = self.instance?;
        instance.get_memory(&mut self.store, "memory")
    }

    fn restore_memory(&mut self, instance: Instance, blob: &[u8]) -> wasmtime::Result<()> {
        let memory = instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| wasmtime::Error::msg("module exports no memory to restore into"))?;
        let size = memory.data_size(&self.store);
        if blob.len() > size {
            let pages = (blob.len() - size).div_ceil(WASM_PAGE);
            memory.grow(&mut self.store, pages as u64)?;
        }
        memory.data_mut(&mut self.store)[..blob.len()].copy_from_slice(blob);
        Ok(())
    }

    fn invoke(&mut self, instance: Instance, entry: Entry) -> wasmtime::Result<i32> {
        match entry {
            Entry::ProcessMessage => instance
                .get_typed_func::<(), i32>(&mut self.store, entry.name())?
                .call(&mut self.store, ()),
            Entry::TimerEvent(ns) => instance
                .get_typed_func::<i64, i32>(&mut self.store, entry.name())?
                .call(&mut self.store, ns),
        }
    }
}

impl Backend for WasmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasm
    }

    fn load(&mut self, source: &[u8], state: Option<&[u8]>, ctx: &mut CallContext) -> std::result::Result<(), Abort> {
        let module = Module::new(&self.engine, source).map_err(|e| Abort::Load(format!("{e:#}")))?;
        self.arm()?;

        std::mem::swap(&mut self.store.data_mut().ctx, ctx);
        let result = self.linker.instantiate(&mut self.store, &module).and_then(|instance| {
            if let Ok(init) = instance.get_typed_func::<(), ()>(&mut self.store, "_initialize") {
                init.call(&mut self.store, ())?;
            }
            Ok(instance)
        });
        let result = result.map_err(|e| match self.classify(e) {
            Abort::Fault(msg) => Abort::Load(msg),
            abort => abort,
        });
        self.settle_fuel();
        std::mem::swap(&mut self.store.data_mut().ctx, ctx);
        let instance = result?;

        if let Some(blob) = state {
            self.restore_memory(instance, blob)
                .map_err(|e| Abort::Load(format!("invalid state: {e:#}")))?;
        }
        self.instance = Some(instance);
        Ok(())
    }

    fn call(&mut self, entry: Entry, ctx: &mut CallContext) -> std::result::Result<i32, Abort> {
        let instance = self
            .instance
            .ok_or_else(|| Abort::Fault("module not loaded".into()))?;
        self.arm()?;

        std::mem::swap(&mut self.store.data_mut().ctx, ctx);
        let result = self.invoke(instance, entry).map_err(|e| self.classify(e));
        self.settle_fuel();
        std::mem::swap(&mut self.store.data_mut().ctx, ctx);
        result
    }

    fn global(&mut self, name: &str) -> Option<Value> {
        let global = self.instance?.get_global(&mut self.store, name)?;
        match global.get(&mut self.store) {
            Val::I32(i) => Some(Value::Integer(i64::from(i))),
            Val::I64(i) => Some(Value::Integer(i)),
            Val::F32(bits) => Some(Value::Double(f64::from(f32::from_bits(bits)))),
            Val::F64(bits) => Some(Value::Double(f64::from_bits(bits))),
            _ => None,
        }
    }

    fn set_global(&mut self, name: &str, value: Value) -> bool {
        let Some(global) = self
            .instance
            .and_then(|instance| instance.get_global(&mut self.store, name))
        else {
            return false;
        };
        let val = match (global.get(&mut self.store), value) {
            (Val::I32(_), Value::Integer(i)) => match i32::try_from(i) {
                Ok(i) => Val::I32(i),
                Err(_) => return false,
            },
            (Val::I64(_), Value::Integer(i)) => Val::I64(i),
            (Val::F32(_), Value::Double(d)) => Val::F32((d as f32).to_bits()),
            (Val::F64(_), Value::Double(d)) => Val::F64(d.to_bits()),
            _ => return false,
        };
        global.set(&mut self.store, val).is_ok()
    }

    fn snapshot(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(memory) = self.memory() else {
            return Ok(None);
        };
        let image = memory.data(&self.store).to_vec();
        if image.is_empty() {
            return Err(SandboxError::StateFormat("linear memory is empty".into()));
        }
        Ok(Some(image))
    }

    fn memory_in_use(&mut self) -> usize {
        let size = self.memory().map_or(0, |m| m.data_size(&self.store));
        size.max(self.store.data().memory.peak)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let engine = self.engine.clone();
        Some(Arc::new(move || engine.increment_epoch()))
    }

    fn teardown(&mut self) {
        self.instance = None;
        tracing::debug!(plugin = %self.config.name, "wasm instance released");
    }
}

// ---------------------------------------------------------------------------
// Guest memory helpers
// ---------------------------------------------------------------------------

fn exported_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(wasmtime::Error::msg("module must export its linear memory as `memory`")),
    }
}

fn guest_range(len_total: usize, ptr: i32, len: i32) -> wasmtime::Result<std::ops::Range<usize>> {
    let start = usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("negative guest pointer"))?;
    let len = usize::try_from(len).map_err(|_| wasmtime::Error::msg("negative guest length"))?;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= len_total)
        .ok_or_else(|| wasmtime::Error::msg(format!("guest range {start}+{len} out of bounds")))?;
    Ok(start..end)
}

fn guest_bytes(data: &[u8], ptr: i32, len: i32) -> wasmtime::Result<&[u8]> {
    Ok(&data[guest_range(data.len(), ptr, len)?])
}

fn guest_str(data: &[u8], ptr: i32, len: i32) -> wasmtime::Result<&str> {
    std::str::from_utf8(guest_bytes(data, ptr, len)?).map_err(wasmtime::Error::msg)
}

/// Wire form of a value: strings and bytes verbatim, numbers as 8
/// little-endian bytes, booleans as one byte.
fn encode<'a>(value: &'a ValueRef<'a>) -> Cow<'a, [u8]> {
    match value {
        ValueRef::String(s) => Cow::Borrowed(s.as_bytes()),
        ValueRef::Bytes(b) => Cow::Borrowed(b.as_ref()),
        ValueRef::Integer(i) => Cow::Owned(i.to_le_bytes().to_vec()),
        ValueRef::Double(d) => Cow::Owned(d.to_le_bytes().to_vec()),
        ValueRef::Bool(b) => Cow::Owned(vec![u8::from(*b)]),
    }
}

fn decode(kind: i32, bytes: &[u8]) -> std::result::Result<Value, FieldError> {
    let kind = u32::try_from(kind)
        .ok()
        .and_then(ValueKind::from_code)
        .ok_or_else(|| FieldError::InvalidValue(format!("unknown value kind {kind}")))?;
    let eight = |bytes: &[u8]| -> std::result::Result<[u8; 8], FieldError> {
        bytes
            .try_into()
            .map_err(|_| FieldError::InvalidValue(format!("{kind} values are 8 bytes, got {}", bytes.len())))
    };
    Ok(match kind {
        ValueKind::String => Value::String(
            String::from_utf8(bytes.to_vec()).map_err(|e| FieldError::InvalidValue(e.to_string()))?,
        ),
        ValueKind::Bytes => Value::Bytes(bytes.to_vec()),
        ValueKind::Integer => Value::Integer(i64::from_le_bytes(eight(bytes)?)),
        ValueKind::Double => Value::Double(f64::from_le_bytes(eight(bytes)?)),
        ValueKind::Bool => Value::Bool(bytes.first().is_some_and(|b| *b != 0)),
    })
}

/// Copy `value` into guest memory and build the `kind << 32 | len` result.
fn deliver(data: &mut [u8], value: Option<ValueRef<'_>>, out_ptr: i32, out_cap: i32) -> wasmtime::Result<i64> {
    let Some(value) = value else {
        return Ok(-1);
    };
    let bytes = encode(&value);
    let cap = usize::try_from(out_cap).unwrap_or(0);
    let copy = bytes.len().min(cap);
    let range = guest_range(data.len(), out_ptr, copy as i32)?;
    data[range].copy_from_slice(&bytes[..copy]);
    Ok((i64::from(value.kind().code()) << 32) | bytes.len() as i64)
}

// ---------------------------------------------------------------------------
// Host functions
// ---------------------------------------------------------------------------

fn define_host_functions(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "env",
        "read_message",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         fi: i64,
         ai: i64,
         out_ptr: i32,
         out_cap: i32|
         -> wasmtime::Result<i64> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let name = guest_str(data, name_ptr, name_len)?.to_owned();
            let value = state.ctx.read_message(&name, fi, ai);
            deliver(data, value, out_ptr, out_cap)
        },
    )?;

    linker.func_wrap(
        "env",
        "write_message",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         kind: i32,
         val_ptr: i32,
         val_len: i32,
         rep_ptr: i32,
         rep_len: i32,
         fi: i64,
         ai: i64|
         -> wasmtime::Result<i32> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let name = guest_str(data, name_ptr, name_len)?;
            let rep = guest_str(data, rep_ptr, rep_len)?;
            let value = match decode(kind, guest_bytes(data, val_ptr, val_len)?) {
                Ok(value) => value,
                Err(err) => {
                    context::report(&state.config, "write_message", &err);
                    return Ok(1);
                }
            };
            let ok = state.ctx.write_message(&state.config, name, value, rep, fi, ai);
            Ok(i32::from(!ok))
        },
    )?;

    linker.func_wrap(
        "env",
        "delete_field",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         fi: i64,
         ai: i64,
         has_ai: i32|
         -> wasmtime::Result<i32> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let name = guest_str(data, name_ptr, name_len)?;
            let ai = (has_ai != 0).then_some(ai);
            let ok = state.ctx.delete_field(&state.config, name, fi, ai);
            Ok(i32::from(!ok))
        },
    )?;

    linker.func_wrap(
        "env",
        "read_next_field",
        |mut caller: Caller<'_, HostState>, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(field) = state.ctx.peek_next_field() else {
                return Ok(0);
            };
            let value = field.value.as_ref().map(encode).unwrap_or_default();
            let mut record = Vec::with_capacity(20 + field.name.len() + field.representation.len() + value.len());
            for word in [
                field.kind.code(),
                field.count as u32,
                field.name.len() as u32,
                field.representation.len() as u32,
                value.len() as u32,
            ] {
                record.extend_from_slice(&word.to_le_bytes());
            }
            record.extend_from_slice(field.name.as_bytes());
            record.extend_from_slice(field.representation.as_bytes());
            record.extend_from_slice(&value);

            if record.len() > usize::try_from(out_cap).unwrap_or(0) {
                return Ok(-1);
            }
            let range = guest_range(data.len(), out_ptr, record.len() as i32)?;
            data[range].copy_from_slice(&record);
            state.ctx.advance_field_cursor();
            Ok(record.len() as i32)
        },
    )?;

    linker.func_wrap(
        "env",
        "read_config",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         out_ptr: i32,
         out_cap: i32|
         -> wasmtime::Result<i64> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let name = guest_str(data, name_ptr, name_len)?;
            let value = state.ctx.read_config(&state.config, name);
            let value = value.map(|v| match v {
                Value::String(s) => ValueRef::String(Cow::Owned(s)),
                Value::Bytes(b) => ValueRef::Bytes(Cow::Owned(b)),
                Value::Integer(i) => ValueRef::Integer(i),
                Value::Double(d) => ValueRef::Double(d),
                Value::Bool(b) => ValueRef::Bool(b),
            });
            deliver(data, value, out_ptr, out_cap)
        },
    )?;

    linker.func_wrap(
        "env",
        "inject_message",
        |mut caller: Caller<'_, HostState>,
         payload_ptr: i32,
         payload_len: i32,
         type_ptr: i32,
         type_len: i32,
         name_ptr: i32,
         name_len: i32|
         -> wasmtime::Result<i32> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let payload = guest_bytes(data, payload_ptr, payload_len)?;
            let payload_type = guest_str(data, type_ptr, type_len)?;
            let payload_name = guest_str(data, name_ptr, name_len)?;
            state
                .ctx
                .inject_message(&state.config, payload, payload_type, payload_name)
                .map_err(|kind| wasmtime::Error::msg(format!("{kind} limit exceeded")))
        },
    )?;

    linker.func_wrap(
        "env",
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, msg_ptr: i32, msg_len: i32| -> wasmtime::Result<()> {
            let memory = exported_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let msg = String::from_utf8_lossy(guest_bytes(data, msg_ptr, msg_len)?);
            let plugin = state.config.name.as_str();
            match level {
                0 => tracing::error!(plugin, guest_msg = %msg),
                1 => tracing::warn!(plugin, guest_msg = %msg),
                2 => tracing::info!(plugin, guest_msg = %msg),
                3 => tracing::debug!(plugin, guest_msg = %msg),
                _ => tracing::trace!(plugin, guest_msg = %msg),
            }
            Ok(())
        },
    )?;

    Ok(())
}
