use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
};

use modwire::{
    bus::EventBus,
    plugin::{LoadError, ModuleHost, PluginRegistry, SharedContracts},
    port::PortRegistry,
};
use module_plugin::{
    DataKind, Event, MessageBus, Module, PortDirection, SubscriptionFilter, SubscriptionHandle,
    execute_event_name, handler_fn, port_event_name,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wasmtime::Module as WasmArtifact;

/// Escape a string for a WAT data segment.
fn wat_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn info_json(name: &str, ports: Value) -> String {
    wat_str(&json!({ "name": name, "version": "1.0.0", "description": "fixture", "ports": ports }).to_string())
}

/// Executable and tickable counter: every call publishes the running count on `count`.
fn counter_wat(type_name: &str, ctor: i32, init_status: i32) -> String {
    let info = info_json(
        type_name,
        json!([{ "name": "count", "kind": "number", "direction": "output" }]),
    );
    format!(
        r#"(module
  (import "modwire" "publish_number" (func $publish (param i32 f64)))
  (import "modwire" "log" (func $log (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 8) "count\00")
  (data (i32.const 32) "hello from {t}\00")
  (data (i32.const 128) "{info}\00")
  (global $count (mut i32) (i32.const 0))
  (func $bump
    global.get $count
    i32.const 1
    i32.add
    global.set $count
    i32.const 8
    global.get $count
    f64.convert_i32_s
    call $publish)
  (func (export "{t}.new") (result i32) i32.const {ctor})
  (func (export "{t}.info") (param i32) (result i32) i32.const 128)
  (func (export "{t}.init") (param i32) (result i32)
    i32.const 2
    i32.const 32
    call $log
    i32.const {init_status})
  (func (export "{t}.shutdown") (param i32) (result i32) i32.const 0)
  (func (export "{t}.execute") (param i32) (result i32) call $bump i32.const 0)
  (func (export "{t}.tick") (param i32) (result i32) call $bump i32.const 0))"#,
        t = type_name,
        info = info,
        ctor = ctor,
        init_status = init_status,
    )
}

/// Publishes `mathlib.scale(10)` on `value` when executed.
fn scaler_wat() -> String {
    scaler_importing("mathlib")
}

fn scaler_importing(library: &str) -> String {
    let info = info_json(
        "Scaler",
        json!([{ "name": "value", "kind": "number", "direction": "output" }]),
    );
    format!(
        r#"(module
  (import "{library}" "scale" (func $scale (param f64) (result f64)))
  (import "modwire" "publish_number" (func $publish (param i32 f64)))
  (memory (export "memory") 1)
  (data (i32.const 8) "value\00")
  (data (i32.const 64) "{info}\00")
  (func (export "Scaler.new") (result i32) i32.const 0)
  (func (export "Scaler.info") (param i32) (result i32) i32.const 64)
  (func (export "Scaler.init") (param i32) (result i32) i32.const 0)
  (func (export "Scaler.shutdown") (param i32) (result i32) i32.const 0)
  (func (export "Scaler.execute") (param i32) (result i32)
    i32.const 8
    f64.const 10
    call $scale
    call $publish
    i32.const 0))"#,
        info = info,
        library = library,
    )
}

fn mathlib_wat(factor: f64) -> String {
    format!(
        r#"(module
  (func (export "scale") (param f64) (result f64)
    local.get 0
    f64.const {factor}
    f64.mul))"#,
        factor = factor
    )
}

/// Forwards whatever arrives on `in` to `out` as JSON.
fn echo_wat() -> String {
    let info = info_json(
        "Echo",
        json!([
            { "name": "in", "kind": "text", "direction": "input" },
            { "name": "out", "kind": "json", "direction": "output" }
        ]),
    );
    format!(
        r#"(module
  (import "modwire" "publish_json" (func $publish (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 8) "out\00")
  (data (i32.const 64) "{info}\00")
  (global $heap (mut i32) (i32.const 4096))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "Echo.new") (result i32) i32.const 0)
  (func (export "Echo.info") (param i32) (result i32) i32.const 64)
  (func (export "Echo.init") (param i32) (result i32) i32.const 0)
  (func (export "Echo.shutdown") (param i32) (result i32) i32.const 0)
  (func (export "Echo.input") (param i32 i32 i32) (result i32)
    i32.const 8
    local.get 2
    call $publish
    i32.const 0))"#,
        info = info,
    )
}

fn write_plugin(root: &Path, dir: &str, name: &str, wat: &str) -> PathBuf {
    let plugin_dir = root.join(dir);
    fs::create_dir_all(&plugin_dir).unwrap();
    let manifest = json!({ "name": name, "version": "1.0.0", "entryAssembly": "module.wat" });
    fs::write(plugin_dir.join("manifest.json"), manifest.to_string()).unwrap();
    fs::write(plugin_dir.join("module.wat"), wat).unwrap();
    plugin_dir
}

fn write_dep(plugin_dir: &Path, name: &str, wat: &str) {
    let deps = plugin_dir.join("deps");
    fs::create_dir_all(&deps).unwrap();
    fs::write(deps.join(format!("{}.wat", name)), wat).unwrap();
}

struct Harness {
    bus: Arc<EventBus>,
    shared: Arc<SharedContracts>,
    host: ModuleHost,
}

impl Harness {
    fn new() -> Self {
        let bus = Arc::new(EventBus::new());
        let shared = Arc::new(SharedContracts::default());
        let host = ModuleHost::new(
            Arc::clone(&shared),
            Arc::clone(&bus),
            Arc::new(PluginRegistry::new()),
            Arc::new(PortRegistry::new()),
        );
        Self { bus, shared, host }
    }

    /// Record every value published on `event`.
    fn collect(&self, event: String, kind: DataKind) -> (Arc<Mutex<Vec<Value>>>, SubscriptionHandle) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = self.bus.subscribe(
            SubscriptionFilter::kind(kind).with_name(event),
            handler_fn(move |event, _cancel| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(event.payload.to_json());
                    Ok(())
                }
            }),
        );
        (seen, handle)
    }

    async fn execute(&self, id: &str) {
        let report = self
            .bus
            .dispatch(Event::trigger(execute_event_name(id)), CancellationToken::new())
            .await;
        assert_eq!(report.delivered, 1, "no execute dispatcher for {}", id);
        assert!(report.is_clean(), "{}", report.failure_summary());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_counter_plugin_executes_and_ticks() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "counter", "counter", &counter_wat("Counter", 1, 0));
    let h = Harness::new();
    let (seen, _sub) = h.collect(port_event_name("counter", "count"), DataKind::Number);

    let result = h.host.load_directory(&dir).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.module_id(), Some("counter"));

    let registration = h.host.registry().get("counter").unwrap();
    assert_eq!(registration.module.info().name, "Counter");
    assert!(registration.executable.is_some());
    let tickable = registration.tickable.clone().unwrap();

    let port = h
        .host
        .ports()
        .find("counter", PortDirection::Output, "count")
        .unwrap();
    assert_eq!(port.kind, DataKind::Number);

    h.execute("counter").await;
    tickable.tick(CancellationToken::new()).await.unwrap();
    tickable.tick(CancellationToken::new()).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![json!(1.0), json!(2.0), json!(3.0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_private_dependencies_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let doubler = write_plugin(tmp.path(), "doubler", "doubler", &scaler_wat());
    write_dep(&doubler, "mathlib", &mathlib_wat(2.0));
    let tripler = write_plugin(tmp.path(), "tripler", "tripler", &scaler_wat());
    write_dep(&tripler, "mathlib", &mathlib_wat(3.0));

    let h = Harness::new();
    let (doubled, _a) = h.collect(port_event_name("doubler", "value"), DataKind::Number);
    let (tripled, _b) = h.collect(port_event_name("tripler", "value"), DataKind::Number);

    let results = h.host.scan(tmp.path()).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_success()), "{:?}", results);

    h.execute("doubler").await;
    h.execute("tripler").await;
    assert_eq!(*doubled.lock().unwrap(), vec![json!(20.0)]);
    assert_eq!(*tripled.lock().unwrap(), vec![json!(30.0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_library_fallback() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "scaler", "scaler", &scaler_wat());

    let h = Harness::new();
    let first = h.host.load_directory(&dir).await;
    assert!(matches!(
        first.error,
        Some(LoadError::UnresolvedDependency { ref name, .. }) if name == "mathlib"
    ));

    let lib = WasmArtifact::new(h.shared.engine(), mathlib_wat(5.0)).unwrap();
    h.shared.register_library("mathlib", lib);
    let (seen, _sub) = h.collect(port_event_name("scaler", "value"), DataKind::Number);

    let second = h.host.load_directory(&dir).await;
    assert!(second.is_success(), "{:?}", second.error);
    h.execute("scaler").await;
    assert_eq!(*seen.lock().unwrap(), vec![json!(50.0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_ports_reach_the_plugin() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "echo", "echo", &echo_wat());
    let h = Harness::new();
    let (seen, _sub) = h.collect(port_event_name("echo", "out"), DataKind::Json);

    let result = h.host.load_directory(&dir).await;
    assert!(result.is_success(), "{:?}", result.error);
    // inputs only, so there is nothing to execute
    assert!(h.host.registry().get("echo").unwrap().executable.is_none());

    h.bus
        .publish(Event::text(port_event_name("echo", "in"), "hello"))
        .await;
    h.bus
        .publish(Event::text(port_event_name("echo", "in"), "again"))
        .await;
    assert_eq!(*seen.lock().unwrap(), vec![json!("hello"), json!("again")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_failures_are_reported_not_raised() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    // a: no manifest
    fs::create_dir_all(root.join("a-empty")).unwrap();
    // b: malformed manifest
    fs::create_dir_all(root.join("b-badjson")).unwrap();
    fs::write(root.join("b-badjson/manifest.json"), "{ not json").unwrap();
    // c: entry missing
    fs::create_dir_all(root.join("c-noentry")).unwrap();
    fs::write(
        root.join("c-noentry/manifest.json"),
        json!({ "name": "c", "version": "1", "entryAssembly": "missing.wasm" }).to_string(),
    )
    .unwrap();
    // d: not a wasm module
    let d = write_plugin(root, "d-garbage", "d", "");
    fs::write(d.join("module.wat"), "this is not wasm").unwrap();
    // e: nothing implements the module contract
    write_plugin(
        root,
        "e-noimpl",
        "e",
        r#"(module (memory (export "memory") 1) (func (export "helper") (result i32) i32.const 0))"#,
    );
    // f: contract present, constructor missing
    write_plugin(
        root,
        "f-noctor",
        "f",
        r#"(module
  (memory (export "memory") 1)
  (func (export "X.info") (param i32) (result i32) i32.const 0)
  (func (export "X.init") (param i32) (result i32) i32.const 0)
  (func (export "X.shutdown") (param i32) (result i32) i32.const 0))"#,
    );
    // g: constructor reports failure
    write_plugin(root, "g-badctor", "g", &counter_wat("G", -1, 0));
    // h: init reports failure
    write_plugin(root, "h-badinit", "h", &counter_wat("H", 1, 7));
    // i: healthy
    write_plugin(root, "i-good", "good", &counter_wat("Good", 1, 0));

    let h = Harness::new();
    let results = h.host.scan(root).await;
    assert_eq!(results.len(), 9);

    let errors: Vec<_> = results.iter().map(|r| r.error.clone()).collect();
    assert!(matches!(errors[0], Some(LoadError::ManifestNotFound(_))));
    assert!(matches!(errors[1], Some(LoadError::ManifestInvalid { .. })));
    assert!(matches!(errors[2], Some(LoadError::EntryNotFound(_))));
    assert!(matches!(errors[3], Some(LoadError::Compile { .. })));
    assert!(matches!(errors[4], Some(LoadError::NoImplementation(_))));
    assert_eq!(errors[5], Some(LoadError::MissingConstructor("X".to_string())));
    assert!(matches!(errors[6], Some(LoadError::ConstructorFailed { ref type_name, .. }) if type_name == "G"));
    assert!(matches!(errors[7], Some(LoadError::Initialization(ref reason)) if reason.contains("status 7")));
    assert_eq!(errors[8], None);

    // failures carry the module name whenever the manifest was readable
    assert_eq!(results[2].module_id(), Some("c"));
    assert_eq!(results[7].module_id(), Some("h"));
    assert_eq!(h.host.registry().ids(), vec!["good".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_module_name_is_rejected() {
    let tmp = TempDir::new().unwrap();
    write_plugin(tmp.path(), "one", "counter", &counter_wat("Counter", 1, 0));
    let second = write_plugin(tmp.path(), "two", "counter", &counter_wat("Counter", 1, 0));

    let h = Harness::new();
    let results = h.host.scan(tmp.path()).await;
    assert!(results[0].is_success());
    assert_eq!(
        results[1].error,
        Some(LoadError::AlreadyRegistered("counter".to_string()))
    );
    assert!(results[1].context.as_ref().unwrap().is_unloaded());
    assert_eq!(h.host.registry().len(), 1);
    assert_eq!(h.host.module_for_directory(&second), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unload_releases_the_module() {
    let tmp = TempDir::new().unwrap();
    let dir = write_plugin(tmp.path(), "counter", "counter", &counter_wat("Counter", 1, 0));
    let h = Harness::new();

    let result = h.host.load_directory(&dir).await;
    assert!(result.is_success());
    let module: Weak<dyn Module> = Arc::downgrade(result.module.as_ref().unwrap());
    let context = Arc::clone(result.context.as_ref().unwrap());
    drop(result);
    assert_eq!(h.host.module_for_directory(&dir).as_deref(), Some("counter"));

    h.host.unload_module("counter").await.unwrap();

    assert!(context.is_unloaded());
    assert!(module.upgrade().is_none());
    assert!(!h.host.registry().contains("counter"));
    assert!(h.host.ports().ports("counter").is_empty());
    let report = h
        .bus
        .dispatch(Event::trigger(execute_event_name("counter")), CancellationToken::new())
        .await;
    assert_eq!(report.delivered, 0);

    assert!(h.host.unload_module("counter").await.is_err());

    // the directory can be loaded again afterwards
    assert!(h.host.load_directory(&dir).await.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugins_cannot_reach_outside_their_directory() {
    let tmp = TempDir::new().unwrap();
    let victim = write_plugin(tmp.path(), "victim", "victim", &scaler_wat());
    write_dep(&victim, "mathlib", &mathlib_wat(7.0));
    write_plugin(
        tmp.path(),
        "thief",
        "thief",
        &scaler_importing("../../victim/deps/mathlib"),
    );
    let sneaky = tmp.path().join("sneaky");
    fs::create_dir_all(&sneaky).unwrap();
    fs::write(
        sneaky.join("manifest.json"),
        json!({ "name": "sneaky", "version": "1", "entryAssembly": "../victim/module.wat" }).to_string(),
    )
    .unwrap();

    let h = Harness::new();
    let results = h.host.scan(tmp.path()).await;
    let by_dir = |name: &str| {
        results
            .iter()
            .find(|r| r.directory.ends_with(name))
            .and_then(|r| r.error.clone())
    };

    assert!(matches!(by_dir("sneaky"), Some(LoadError::ManifestInvalid { .. })));
    assert!(matches!(
        by_dir("thief"),
        Some(LoadError::UnresolvedDependency { ref name, .. }) if name == "../../victim/deps/mathlib"
    ));
    assert_eq!(by_dir("victim"), None);
    assert_eq!(h.host.registry().ids(), vec!["victim".to_string()]);
}
