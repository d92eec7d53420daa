//! Rhai backend.
//!
//! Scripts define `process_message()` and/or `timer_event(ns)`.  Persistent
//! guest state is the object map bound as `this` on every call; it is also
//! the state blob written by `destroy` (as JSON).  The engine's progress
//! hook runs on every operation and feeds the shared [`InstructionMeter`].
//! Live memory is sampled from the variable resolver, which sees the call's
//! whole scope stack; values shared between variables are counted once per
//! variable.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ::rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use ::rhai::{
    AST, Array, Blob, CallFnOptions, Dynamic, Engine, EvalAltResult, INT, ImmutableString, Map,
    Position, Scope,
};
use sluice_pipeline::Value;

use super::{Backend, BackendKind, Entry};
use crate::config::SandboxConfig;
use crate::context::{self, CallContext};
use crate::error::{FieldError, Result, SandboxError};
use crate::governor::{Abort, InstructionMeter, MemoryGauge, UsageType};

type Slot = Arc<Mutex<CallContext>>;

fn lock(slot: &Slot) -> MutexGuard<'_, CallContext> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RhaiBackend {
    engine: Engine,
    config: Arc<SandboxConfig>,
    slot: Slot,
    ast: Option<AST>,
    state: Dynamic,
    gauge: Arc<MemoryGauge>,
}

impl RhaiBackend {
    pub fn new(config: Arc<SandboxConfig>, meter: Arc<InstructionMeter>) -> Self {
        let slot = Slot::default();
        let gauge = Arc::new(MemoryGauge::new(config.memory_limit));
        let mut engine = Engine::new();

        // Zero disables these caps in rhai.
        let max_bytes = config.memory_limit.max(1);
        let max_items = (max_bytes / std::mem::size_of::<Dynamic>()).max(1);
        engine.set_max_string_size(max_bytes);
        engine.set_max_array_size(max_items);
        engine.set_max_map_size(max_items);
        engine.disable_symbol("eval");

        let sampler = Arc::clone(&gauge);
        let progress = Arc::clone(&meter);
        engine.on_var(move |_name, _index, ctx| {
            if !sampler.sample_due(progress.executed()) {
                return Ok(None);
            }
            let live = ctx
                .scope()
                .iter_raw()
                .map(|(_, _, value)| footprint(value))
                .sum::<usize>()
                + ctx.this_ptr().map_or(0, footprint);
            match sampler.observe(live) {
                Some(abort) => Err(EvalAltResult::ErrorTerminated(Dynamic::from(abort), Position::NONE).into()),
                None => Ok(None),
            }
        });
        engine.on_progress(move |ops| meter.checkpoint(ops).map(Dynamic::from));

        let plugin = config.name.clone();
        engine.on_print(move |text| tracing::info!(plugin = %plugin, "{text}"));
        let plugin = config.name.clone();
        engine.on_debug(move |text, _source, pos| tracing::debug!(plugin = %plugin, %pos, "{text}"));

        let mut resolvers = ModuleResolversCollection::new();
        for dir in config.module_paths().into_iter().filter(|d| d.is_dir()) {
            resolvers.push(FileModuleResolver::new_with_path(dir));
        }
        engine.set_module_resolver(resolvers);

        register_protocol(
            &mut engine,
            &Host {
                slot: Arc::clone(&slot),
                config: Arc::clone(&config),
            },
        );

        Self {
            engine,
            config,
            slot,
            ast: None,
            state: Dynamic::from_map(Map::new()),
            gauge,
        }
    }

    /// Run `f` with `ctx` installed where the host functions can reach it.
    fn with_context<T>(&mut self, ctx: &mut CallContext, f: impl FnOnce(&mut Self) -> T) -> T {
        *lock(&self.slot) = std::mem::take(ctx);
        let out = f(self);
        *ctx = std::mem::take(&mut *lock(&self.slot));
        out
    }
}

impl Backend for RhaiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rhai
    }

    fn load(&mut self, source: &[u8], state: Option<&[u8]>, ctx: &mut CallContext) -> std::result::Result<(), Abort> {
        let text = std::str::from_utf8(source)
            .map_err(|e| Abort::Load(format!("script is not valid UTF-8: {e}")))?;
        let ast = self.engine.compile(text).map_err(|e| Abort::Load(e.to_string()))?;

        if let Some(blob) = state {
            let restored: Dynamic = serde_json::from_slice(blob)
                .map_err(|e| Abort::Load(format!("invalid state: {e}")))?;
            if !restored.is_map() {
                return Err(Abort::Load("invalid state: not an object map".into()));
            }
            self.state = restored;
        }

        self.gauge.begin();
        let result = self.with_context(ctx, |this| {
            let mut scope = Scope::new();
            this.engine.run_ast_with_scope(&mut scope, &ast)
        });
        result.map_err(|err| match classify(*err) {
            Abort::Fault(msg) => Abort::Load(msg),
            other => other,
        })?;

        self.ast = Some(ast);
        Ok(())
    }

    fn call(&mut self, entry: Entry, ctx: &mut CallContext) -> std::result::Result<i32, Abort> {
        if self.ast.is_none() {
            return Err(Abort::Fault("script not loaded".into()));
        }
        self.gauge.begin();
        let result = self.with_context(ctx, |this| {
            let Some(ast) = this.ast.as_ref() else {
                return Ok(Dynamic::UNIT);
            };
            let mut scope = Scope::new();
            let options = CallFnOptions::new()
                .eval_ast(false)
                .rewind_scope(true)
                .bind_this_ptr(&mut this.state);
            match entry {
                Entry::ProcessMessage => {
                    this.engine
                        .call_fn_with_options::<Dynamic>(options, &mut scope, ast, entry.name(), ())
                }
                Entry::TimerEvent(ns) => {
                    this.engine
                        .call_fn_with_options::<Dynamic>(options, &mut scope, ast, entry.name(), (ns,))
                }
            }
        });

        let status = result.map_err(|err| classify(*err))?;
        status
            .as_int()
            .ok()
            .and_then(|code| i32::try_from(code).ok())
            .ok_or_else(|| {
                Abort::Fault(format!(
                    "{}() must return an integer status, got {}",
                    entry.name(),
                    status.type_name()
                ))
            })
    }

    fn global(&mut self, name: &str) -> Option<Value> {
        let map = self.state.read_lock::<Map>()?;
        from_dynamic(map.get(name)?)
    }

    fn set_global(&mut self, name: &str, value: Value) -> bool {
        match self.state.write_lock::<Map>() {
            Some(mut map) => {
                map.insert(name.into(), to_dynamic(value));
                true
            }
            None => false,
        }
    }

    fn snapshot(&mut self) -> Result<Option<Vec<u8>>> {
        let empty = self.state.read_lock::<Map>().is_some_and(|m| m.is_empty());
        if empty {
            return Ok(None);
        }
        serde_json::to_vec(&self.state)
            .map(Some)
            .map_err(|e| SandboxError::StateFormat(e.to_string()))
    }

    fn memory_in_use(&mut self) -> usize {
        self.gauge.peak().max(footprint(&self.state))
    }

    fn teardown(&mut self) {
        self.ast = None;
        tracing::debug!(plugin = %self.config.name, "rhai engine released");
    }
}

// ---------------------------------------------------------------------------
// Host protocol
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Host {
    slot: Slot,
    config: Arc<SandboxConfig>,
}

impl Host {
    fn read(&self, name: &str, fi: INT, ai: INT) -> Dynamic {
        let ctx = lock(&self.slot);
        ctx.read_message(name, fi, ai)
            .map_or(Dynamic::UNIT, |v| to_dynamic(v.into_owned()))
    }

    fn write(&self, name: &str, value: &Dynamic, rep: &str, fi: INT, ai: INT) -> bool {
        let Some(value) = from_dynamic(value) else {
            let err = FieldError::InvalidValue(format!("cannot store a {}", value.type_name()));
            context::report(&self.config, "write_message", &err);
            return false;
        };
        lock(&self.slot).write_message(&self.config, name, value, rep, fi, ai)
    }

    fn delete(&self, name: &str, fi: INT, ai: Option<INT>) -> bool {
        lock(&self.slot).delete_field(&self.config, name, fi, ai)
    }

    fn next_field(&self) -> Dynamic {
        let mut ctx = lock(&self.slot);
        let Some(field) = ctx.read_next_field() else {
            return Dynamic::UNIT;
        };
        let mut map = Map::new();
        map.insert("name".into(), Dynamic::from(field.name.to_owned()));
        map.insert(
            "representation".into(),
            Dynamic::from(field.representation.to_owned()),
        );
        map.insert("kind".into(), Dynamic::from(field.kind.as_str().to_owned()));
        map.insert(
            "value".into(),
            field.value.map_or(Dynamic::UNIT, |v| to_dynamic(v.into_owned())),
        );
        map.insert("count".into(), Dynamic::from_int(field.count as INT));
        Dynamic::from_map(map)
    }

    fn read_config(&self, name: &str) -> Dynamic {
        lock(&self.slot)
            .read_config(&self.config, name)
            .map_or(Dynamic::UNIT, to_dynamic)
    }

    fn inject(&self, payload: &Dynamic, payload_type: &str, payload_name: &str) -> std::result::Result<INT, Box<EvalAltResult>> {
        let bytes = match from_dynamic(payload) {
            Some(Value::Bytes(b)) => b,
            Some(Value::String(s)) => s.into_bytes(),
            _ => payload.to_string().into_bytes(),
        };
        let outcome = lock(&self.slot).inject_message(&self.config, &bytes, payload_type, payload_name);
        match outcome {
            Ok(code) => Ok(INT::from(code)),
            Err(kind) => Err(EvalAltResult::ErrorTerminated(Dynamic::from(Abort::Limit(kind)), Position::NONE).into()),
        }
    }
}

fn register_protocol(engine: &mut Engine, host: &Host) {
    let h = host.clone();
    engine.register_fn("read_message", move |name: &str| h.read(name, 0, 0));
    let h = host.clone();
    engine.register_fn("read_message", move |name: &str, fi: INT| h.read(name, fi, 0));
    let h = host.clone();
    engine.register_fn("read_message", move |name: &str, fi: INT, ai: INT| h.read(name, fi, ai));

    let h = host.clone();
    engine.register_fn("write_message", move |name: &str, value: Dynamic| h.write(name, &value, "", 0, 0));
    let h = host.clone();
    engine.register_fn("write_message", move |name: &str, value: Dynamic, rep: &str| {
        h.write(name, &value, rep, 0, 0)
    });
    let h = host.clone();
    engine.register_fn(
        "write_message",
        move |name: &str, value: Dynamic, rep: &str, fi: INT| h.write(name, &value, rep, fi, 0),
    );
    let h = host.clone();
    engine.register_fn(
        "write_message",
        move |name: &str, value: Dynamic, rep: &str, fi: INT, ai: INT| h.write(name, &value, rep, fi, ai),
    );

    let h = host.clone();
    engine.register_fn("delete_field", move |name: &str| h.delete(name, 0, None));
    let h = host.clone();
    engine.register_fn("delete_field", move |name: &str, fi: INT| h.delete(name, fi, None));
    let h = host.clone();
    engine.register_fn("delete_field", move |name: &str, fi: INT, ai: INT| h.delete(name, fi, Some(ai)));

    let h = host.clone();
    engine.register_fn("read_next_field", move || h.next_field());

    let h = host.clone();
    engine.register_fn("read_config", move |name: &str| h.read_config(name));

    let h = host.clone();
    engine.register_fn("inject_message", move |payload: Dynamic| h.inject(&payload, "", ""));
    let h = host.clone();
    engine.register_fn(
        "inject_message",
        move |payload: Dynamic, payload_type: &str, payload_name: &str| {
            h.inject(&payload, payload_type, payload_name)
        },
    );
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::String(s) => Dynamic::from(ImmutableString::from(s)),
        Value::Bytes(b) => Dynamic::from_blob(b),
        Value::Integer(i) => Dynamic::from_int(i),
        Value::Double(d) => Dynamic::from_float(d),
        Value::Bool(b) => Dynamic::from_bool(b),
    }
}

fn from_dynamic(value: &Dynamic) -> Option<Value> {
    if let Ok(i) = value.as_int() {
        return Some(Value::Integer(i));
    }
    if let Ok(d) = value.as_float() {
        return Some(Value::Double(d));
    }
    if let Ok(b) = value.as_bool() {
        return Some(Value::Bool(b));
    }
    if value.is_string() {
        return value.clone().into_string().ok().map(Value::String);
    }
    if value.is_blob() {
        return value.clone().into_blob().ok().map(Value::Bytes);
    }
    None
}

/// Approximate heap footprint of a guest value.
fn footprint(value: &Dynamic) -> usize {
    let nested = if let Some(map) = value.read_lock::<Map>() {
        map.iter().map(|(k, v)| k.len() + footprint(v)).sum()
    } else if let Some(array) = value.read_lock::<Array>() {
        array.iter().map(footprint).sum()
    } else if let Some(s) = value.read_lock::<ImmutableString>() {
        s.len()
    } else if let Some(blob) = value.read_lock::<Blob>() {
        blob.len()
    } else {
        0
    };
    std::mem::size_of::<Dynamic>() + nested
}

fn classify(err: EvalAltResult) -> Abort {
    let text = err.to_string();
    match err {
        EvalAltResult::ErrorTerminated(token, _) => token
            .try_cast::<Abort>()
            .unwrap_or_else(|| Abort::Fault(text)),
        EvalAltResult::ErrorTooManyOperations(_) => Abort::Limit(UsageType::Instruction),
        EvalAltResult::ErrorDataTooLarge(..) => Abort::Limit(UsageType::Memory),
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            match classify(*inner) {
                Abort::Fault(_) => Abort::Fault(text),
                abort => abort,
            }
        }
        _ => Abort::Fault(text),
    }
}
