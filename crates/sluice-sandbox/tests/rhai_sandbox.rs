//! End-to-end tests driving Rhai scripts through the sandbox lifecycle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_pipeline::inject::synthesize;
use sluice_pipeline::{
    Field, FieldValues, GlobalSettings, InjectOutcome, InjectionLimiter, Injector, LogSink, Message, Pack, Value,
};
use sluice_sandbox::{PluginType, Sandbox, SandboxConfig, SandboxError, SandboxStatus, UsageStat, UsageType};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("writing a script must succeed in tests");
    path
}

fn running(config: SandboxConfig) -> Sandbox {
    let mut sandbox = Sandbox::create(config).expect("create must succeed in tests");
    sandbox.init(None).expect("init must succeed in tests");
    sandbox
}

fn sample_pack() -> Pack {
    let mut msg = Message::new();
    msg.msg_type = "nginx.access".into();
    msg.payload = "GET /".into();
    msg.add_field(Field::new("status", Value::Integer(200), "code"));
    msg.add_field(Field::new("host", Value::String("edge-1".into()), ""));
    msg.add_field(Field::new("host", Value::String("edge-2".into()), ""));
    Pack::new(msg)
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<(String, String)>>);

impl LogSink for RecordingSink {
    fn log_message(&self, component: &str, message: &str) {
        self.0
            .lock()
            .expect("sink lock")
            .push((component.to_owned(), message.to_owned()));
    }
}

// ---------------------------------------------------------------------------
// Field protocol
// ---------------------------------------------------------------------------

#[test]
fn reads_headers_and_fields() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "read.rhai",
        r#"
        fn process_message() {
            if read_message("Type") != "nginx.access" { return 1; }
            if read_message("Fields[status]") != 200 { return 2; }
            if read_message("Fields[host]", 1) != "edge-2" { return 3; }
            if type_of(read_message("Fields[host]", 2)) != "()" { return 4; }
            if type_of(read_message("Fields[missing]")) != "()" { return 5; }
            if type_of(read_message("Bogus")) != "()" { return 6; }
            0
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script));
    let mut pack = sample_pack();
    assert_eq!(sandbox.process_message(&mut pack).expect("process"), 0);
    assert_eq!(sandbox.status(), SandboxStatus::Running);
}

#[test]
fn writes_append_and_report_bad_indices() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "write.rhai",
        r#"
        fn process_message() {
            let created = write_message("Fields[tags]", "a");
            let appended = write_message("Fields[tags]", "b", "label", 0, 1);
            let gap = write_message("Fields[tags]", "c", "", 0, 3);
            let mismatch = write_message("Fields[status]", "two hundred");
            write_message("Logger", "rewriter");
            if created && appended && !gap && !mismatch { 0 } else { 1 }
        }
        "#,
    );
    let sink = Arc::new(RecordingSink::default());
    let globals = GlobalSettings::default().with_log_sink(sink.clone());
    let mut sandbox = running(SandboxConfig::new(script).with_globals(Arc::new(globals)));

    let mut pack = sample_pack();
    assert_eq!(sandbox.process_message(&mut pack).expect("process"), 0);

    let tags = pack.message.find_first_field("tags").expect("tags field");
    assert_eq!(tags.values, FieldValues::String(vec!["a".into(), "b".into()]));
    assert_eq!(tags.representation, "label");
    assert_eq!(pack.message.logger, "rewriter");
    assert_eq!(
        pack.message.find_first_field("status").expect("status").values,
        FieldValues::Integer(vec![200])
    );

    let reports = sink.0.lock().expect("sink lock");
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|(component, _)| component == "write_message"));
}

#[test]
fn deletes_fields_and_elements() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "delete.rhai",
        r#"
        fn process_message() {
            write_message("Fields[status]", 404, "code", 0, 1);
            delete_field("Fields[status]", 0, 0);
            delete_field("Fields[host]", 1);
            delete_field("Fields[absent]");
            0
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script));
    let mut pack = sample_pack();
    sandbox.process_message(&mut pack).expect("process");

    let status = pack.message.find_first_field("status").expect("status");
    assert_eq!(status.values, FieldValues::Integer(vec![404]));
    let hosts: Vec<_> = pack.message.find_all_fields("host").collect();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].values, FieldValues::String(vec!["edge-1".into()]));
}

#[test]
fn iterates_fields_in_order() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "iterate.rhai",
        r#"
        fn process_message() {
            let names = "";
            loop {
                let f = read_next_field();
                if type_of(f) == "()" { break; }
                names += f.name + ":" + f.count + ";";
            }
            write_message("Payload", names);
            0
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script));
    let mut pack = sample_pack();
    sandbox.process_message(&mut pack).expect("process");
    assert_eq!(pack.message.payload, "status:1;host:1;host:1;");
}

#[test]
fn raw_bytes_visible_only_while_trusted() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "raw.rhai",
        r#"
        fn process_message() {
            let before = read_message("raw");
            write_message("Type", "changed");
            let after = read_message("raw");
            if type_of(before) == "blob" && before.len() == 3 && type_of(after) == "()" { 0 } else { 1 }
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script));
    let mut pack = sample_pack().with_encoded(vec![1, 2, 3]);
    assert_eq!(sandbox.process_message(&mut pack).expect("process"), 0);
    assert!(!pack.trust_msg_bytes);
}

#[test]
fn encoder_writes_copy_the_shared_message() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "encode.rhai",
        r#"
        fn process_message() {
            write_message("Payload", "encoded");
            0
        }
        "#,
    );
    let config = SandboxConfig::new(script).with_plugin_type(PluginType::Encoder);
    let mut sandbox = running(config);

    let mut pack = sample_pack();
    let shared = Arc::clone(&pack.message);
    sandbox.process_message(&mut pack).expect("process");

    assert_eq!(shared.payload, "GET /");
    assert_eq!(pack.message.payload, "encoded");
    assert!(!Arc::ptr_eq(&shared, &pack.message));
}

#[test]
fn config_integers_arrive_as_doubles() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "config.rhai",
        r#"
        fn process_message() {
            let t = read_config("threshold");
            if type_of(t) != "f64" || t != 42.0 { return 1; }
            if read_config("label") != "edge" { return 2; }
            if type_of(read_config("absent")) != "()" { return 3; }
            0
        }
        "#,
    );
    let config = SandboxConfig::new(script)
        .with_config_value("threshold", 42_i64)
        .with_config_value("label", "edge");
    let mut sandbox = running(config);
    assert_eq!(sandbox.process_message(&mut sample_pack()).expect("process"), 0);
}

#[test]
fn imports_modules_from_module_directory() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let modules = dir.path().join("modules");
    std::fs::create_dir(&modules).expect("mkdir");
    write_script(&modules, "util.rhai", "fn double(x) { x * 2 }");
    let script = write_script(
        dir.path(),
        "import.rhai",
        r#"
        fn process_message() {
            import "util" as util;
            util::double(21)
        }
        "#,
    );
    let config = SandboxConfig::new(script).with_module_directory(modules.display().to_string());
    let mut sandbox = running(config);
    assert_eq!(sandbox.process_message(&mut sample_pack()).expect("process"), 42);
}

// ---------------------------------------------------------------------------
// Governance
// ---------------------------------------------------------------------------

#[test]
fn runaway_loop_terminates_on_instruction_limit() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "spin.rhai",
        r#"
        fn process_message() {
            let x = 0;
            loop { x += 1; }
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script).with_instruction_limit(1000));

    let err = sandbox.process_message(&mut sample_pack()).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::ResourceLimitExceeded {
            kind: UsageType::Instruction
        }
    ));
    assert_eq!(sandbox.status(), SandboxStatus::Terminated);
    assert!(sandbox.last_error().contains("instruction_limit"));
    assert!(sandbox.usage(UsageType::Instruction, UsageStat::Maximum) > 1000);

    let err = sandbox.process_message(&mut sample_pack()).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::State {
            status: SandboxStatus::Terminated,
            ..
        }
    ));
}

#[test]
fn string_growth_terminates_on_memory_limit() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "grow.rhai",
        r#"
        fn process_message() {
            let s = "x";
            loop { s += s; }
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script).with_memory_limit(4096));
    let err = sandbox.process_message(&mut sample_pack()).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::ResourceLimitExceeded {
            kind: UsageType::Memory
        }
    ));
    assert!(sandbox.last_error().contains("memory_limit"));
}

#[test]
fn many_live_locals_terminate_on_memory_limit() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "locals.rhai",
        r#"
        fn grow() {
            let s = "x";
            while s.len() < 60000 { s += s; }
            s
        }
        fn process_message() {
            let a = grow(); let b = grow(); let c = grow(); let d = grow();
            let e = grow(); let f = grow(); let g = grow(); let h = grow();
            0
        }
        "#,
    );
    let limit = 64 * 1024;
    let mut sandbox = running(SandboxConfig::new(script).with_memory_limit(limit));
    let err = sandbox.process_message(&mut sample_pack()).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::ResourceLimitExceeded {
            kind: UsageType::Memory
        }
    ));
    assert_eq!(sandbox.status(), SandboxStatus::Terminated);
    assert!(sandbox.last_error().contains("memory_limit"));
    assert!(sandbox.usage(UsageType::Memory, UsageStat::Current) > limit as u64);
    assert!(sandbox.usage(UsageType::Memory, UsageStat::Maximum) > limit as u64);
}

#[test]
fn live_locals_count_toward_memory_usage() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "local.rhai",
        r#"
        fn process_message() {
            let s = "x";
            while s.len() < 4096 { s += s; }
            let n = 0;
            while n < 100 { n += 1; }
            0
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script).with_memory_limit(64 * 1024));
    assert_eq!(sandbox.process_message(&mut sample_pack()).expect("process"), 0);
    assert_eq!(sandbox.status(), SandboxStatus::Running);
    assert!(sandbox.usage(UsageType::Memory, UsageStat::Current) >= 4096);
}

#[test]
fn stop_from_another_thread_halts_a_running_call() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "forever.rhai",
        r#"
        fn process_message() {
            let x = 0;
            loop { x += 1; }
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script).with_instruction_limit(u64::MAX));
    let handle = sandbox.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    let err = sandbox.process_message(&mut sample_pack()).unwrap_err();
    stopper.join().expect("stopper thread");
    assert!(matches!(err, SandboxError::Stopped));
    assert_eq!(sandbox.status(), SandboxStatus::Stopped);
}

#[test]
fn guest_errors_terminate() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "throw.rhai",
        r#"
        fn process_message() { throw "boom"; }
        fn timer_event(ns) { "not a status" }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(&script));
    let err = sandbox.process_message(&mut sample_pack()).unwrap_err();
    assert!(matches!(err, SandboxError::GuestFault(_)));
    assert!(sandbox.last_error().starts_with("process_message()"));
    assert!(sandbox.last_error().contains("boom"));

    let mut sandbox = running(SandboxConfig::new(&script));
    let err = sandbox.timer_event(1).unwrap_err();
    assert!(err.to_string().contains("integer status"));
    assert_eq!(sandbox.status(), SandboxStatus::Terminated);
}

#[test]
fn compile_errors_fail_init() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(dir.path(), "broken.rhai", "fn process_message( {");
    let mut sandbox = Sandbox::create(SandboxConfig::new(script)).expect("create");
    let err = sandbox.init(None).unwrap_err();
    assert!(matches!(err, SandboxError::ScriptLoad { .. }));
    assert_eq!(sandbox.status(), SandboxStatus::Terminated);
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

#[test]
fn injections_pass_through_the_limiter() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "inject.rhai",
        r#"
        fn process_message() {
            let first = inject_message("one", "txt", "first");
            let second = inject_message("two", "txt", "second");
            first * 10 + second
        }
        "#,
    );
    let globals = Arc::new(GlobalSettings::default().with_hostname("edge-9"));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let host_globals = Arc::clone(&globals);
    let downstream: Arc<dyn Injector> = Arc::new(move |payload: &[u8], ty: &str, name: &str| {
        let msg = synthesize(payload, ty, name, "inject", &host_globals);
        sink.lock().expect("delivered lock").push(msg);
        InjectOutcome::Accepted.code()
    });
    let limiter = Arc::new(InjectionLimiter::new(downstream, &globals));

    let mut sandbox = running(SandboxConfig::new(script).with_globals(Arc::clone(&globals)));
    sandbox.inject_message(limiter.clone());
    limiter.begin_call(globals.max_process_inject, 0);

    let status = sandbox.process_message(&mut sample_pack()).expect("process");
    assert_eq!(status, InjectOutcome::CallLimitExceeded.code());
    assert_eq!(limiter.injected(), 1);

    let delivered = delivered.lock().expect("delivered lock");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, "one");
    assert_eq!(delivered[0].hostname, "edge-9");
    assert_eq!(sandbox.usage(UsageType::Output, UsageStat::Current), 3);
}

#[test]
fn oversized_injection_terminates_without_delivery() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "flood.rhai",
        r#"
        fn timer_event(ns) {
            inject_message("0123456789abcdef", "txt", "flood");
            0
        }
        "#,
    );
    let calls = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&calls);
    let injector: Arc<dyn Injector> = Arc::new(move |_: &[u8], _: &str, _: &str| {
        *counter.lock().expect("counter lock") += 1;
        0
    });

    let mut sandbox = running(SandboxConfig::new(script).with_output_limit(8));
    sandbox.inject_message(injector);
    let err = sandbox.timer_event(0).unwrap_err();
    assert!(matches!(
        err,
        SandboxError::ResourceLimitExceeded {
            kind: UsageType::Output
        }
    ));
    assert!(sandbox.last_error().contains("output_limit"));
    assert_eq!(*calls.lock().expect("counter lock"), 0);
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[test]
fn timer_state_survives_destroy_and_init() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "ticks.rhai",
        r#"
        fn timer_event(ns) {
            this.ticks = (this.ticks ?? 0) + 1;
            this.last_ns = ns;
            0
        }
        "#,
    );
    let globals = Arc::new(GlobalSettings::default().with_base_dir(dir.path()));
    let state = globals.state_path("ticks");
    let config = SandboxConfig::new(&script)
        .with_name("ticks")
        .with_globals(Arc::clone(&globals));

    let mut sandbox = running(config.clone());
    sandbox.timer_event(10).expect("tick");
    sandbox.timer_event(20).expect("tick");
    sandbox.destroy(Some(&state)).expect("destroy must succeed in tests");
    assert!(state.exists());

    let mut sandbox = Sandbox::create(config).expect("create");
    sandbox.init(Some(&state)).expect("init from state");
    assert_eq!(sandbox.guest_global("ticks"), Some(Value::Integer(2)));
    sandbox.timer_event(30).expect("tick");
    assert_eq!(sandbox.guest_global("ticks"), Some(Value::Integer(3)));
    assert_eq!(sandbox.guest_global("last_ns"), Some(Value::Integer(30)));
}

#[test]
fn host_can_set_guest_globals() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "limit.rhai",
        r#"
        fn process_message() {
            if read_message("Fields[status]") >= this.cutoff { 1 } else { 0 }
        }
        "#,
    );
    let mut sandbox = running(SandboxConfig::new(script));
    assert!(sandbox.set_guest_global("cutoff", Value::Integer(500)));
    assert_eq!(sandbox.process_message(&mut sample_pack()).expect("process"), 0);
    assert!(sandbox.set_guest_global("cutoff", Value::Integer(200)));
    assert_eq!(sandbox.process_message(&mut sample_pack()).expect("process"), 1);
}

#[test]
fn terminated_sandboxes_do_not_persist_state() {
    let dir = tempfile::tempdir().expect("tempdir must succeed in tests");
    let script = write_script(
        dir.path(),
        "fail.rhai",
        r#"
        fn timer_event(ns) {
            this.seen = true;
            throw "fail";
        }
        "#,
    );
    let state = dir.path().join("state").join("fail.data");
    let mut sandbox = running(SandboxConfig::new(script));
    assert!(sandbox.timer_event(0).is_err());
    sandbox.destroy(Some(&state)).expect("destroy");
    assert!(!state.exists());
}
