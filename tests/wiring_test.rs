use std::{collections::BTreeSet, sync::Arc, time::Duration};

use modwire::{
    bus::EventBus,
    graph::GraphError,
    plugin::{ModuleHost, PluginRegistry, SharedContracts},
    port::PortRegistry,
    wiring::{EngineStatus, NodeOutcome, WiringConfiguration, WiringEngine, WiringError},
};
use module_plugin::{
    Event, ExecutableModule, MessageBus, Module, ModuleContext, ModuleState, Payload,
    port_event_name,
    testing::{
        ChatInputModule, ChatOutputModule, JsonCollector, JsonEmitter, PromptModule, StepBehavior,
        StepModule,
    },
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Harness {
    bus: Arc<EventBus>,
    host: ModuleHost,
    engine: WiringEngine,
}

impl Harness {
    fn new() -> Self {
        let bus = Arc::new(EventBus::new());
        let ports = Arc::new(PortRegistry::new());
        let host = ModuleHost::new(
            Arc::new(SharedContracts::default()),
            Arc::clone(&bus),
            Arc::new(PluginRegistry::new()),
            Arc::clone(&ports),
        );
        let engine = WiringEngine::new(Arc::clone(&bus), ports);
        Self { bus, host, engine }
    }

    fn ctx(&self, id: &str) -> ModuleContext {
        self.host.context_for(id)
    }

    async fn add(&self, id: &str, module: Arc<dyn Module>) {
        self.host.add_module(id, module).await.unwrap();
    }

    async fn add_step(&self, id: &str, behavior: StepBehavior) -> Arc<StepModule> {
        let step = StepModule::new(behavior);
        self.add(id, step.clone()).await;
        step
    }
}

fn chat_config() -> WiringConfiguration {
    WiringConfiguration::new("chat")
        .with_node("input", "ChatInput")
        .with_node("llm", "LLM")
        .with_node("output", "ChatOutput")
        .connect("input", "userMessage", "llm", "prompt")
        .connect("llm", "response", "output", "displayText")
}

fn names(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_chat_round_trip() {
    let h = Harness::new();
    let input = ChatInputModule::new(h.ctx("input"));
    let llm = PromptModule::echo(h.ctx("llm"));
    let output = ChatOutputModule::new(h.ctx("output"));
    h.add("input", input.clone()).await;
    h.add("llm", llm.clone()).await;
    h.add("output", output.clone()).await;

    let levels = h.engine.load_configuration(chat_config()).unwrap();
    assert_eq!(levels, vec![vec!["input"], vec!["llm"], vec!["output"]]);
    assert_eq!(h.engine.status(), EngineStatus::Loaded);

    input.send("Hello").await;
    let report = h.engine.execute(CancellationToken::new()).await.unwrap();

    assert!(report.is_success(), "{:?}", report);
    assert_eq!(output.received().await, vec!["echo: Hello".to_string()]);
    assert_eq!(input.state(), ModuleState::Completed);
    assert_eq!(llm.state(), ModuleState::Completed);
    assert_eq!(output.state(), ModuleState::Completed);
    assert_eq!(h.engine.status(), EngineStatus::Loaded);
}

#[tokio::test]
async fn test_failing_module_blocks_downstream() {
    let h = Harness::new();
    let input = ChatInputModule::new(h.ctx("input"));
    let llm = PromptModule::failing(h.ctx("llm"), "model offline");
    let output = ChatOutputModule::new(h.ctx("output"));
    h.add("input", input.clone()).await;
    h.add("llm", llm.clone()).await;
    h.add("output", output.clone()).await;
    h.engine.load_configuration(chat_config()).unwrap();

    input.send("Hello").await;
    let report = h.engine.execute(CancellationToken::new()).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed, names(&["llm"]));
    assert_eq!(report.skipped, names(&["output"]));
    assert_eq!(h.engine.failed_modules(), names(&["llm"]));
    assert_eq!(llm.state(), ModuleState::Error);
    assert!(llm.last_error().unwrap().contains("model offline"));
    assert_eq!(output.state(), ModuleState::Idle);
    assert!(output.received().await.is_empty());

    let skipped = report.record("output").unwrap();
    assert_eq!(
        skipped.outcome,
        NodeOutcome::Skipped {
            blocked_by: vec!["llm".to_string()]
        }
    );
}

#[tokio::test]
async fn test_fan_out_receivers_get_independent_copies() {
    let h = Harness::new();
    let emitter = JsonEmitter::new(h.ctx("source"), json!({ "value": 42, "tags": ["a"] }));
    let left = JsonCollector::new(h.ctx("left"));
    let right = JsonCollector::new(h.ctx("right"));
    h.add("source", emitter).await;
    h.add("left", left.clone()).await;
    h.add("right", right.clone()).await;

    let config = WiringConfiguration::new("fan-out")
        .with_node("source", "JsonEmitter")
        .with_node("left", "JsonCollector")
        .with_node("right", "JsonCollector")
        .connect("source", "data", "left", "data")
        .connect("source", "data", "right", "data");
    h.engine.load_configuration(config).unwrap();
    assert!(h.engine.execute(CancellationToken::new()).await.unwrap().is_success());

    let left_seen = left.seen().await;
    let right_seen = right.seen().await;
    assert_eq!(left_seen.len(), 1);
    assert_eq!(right_seen.len(), 1);
    assert_eq!(left_seen[0]["stampedBy"], "left");
    assert_eq!(right_seen[0]["stampedBy"], "right");
    assert_eq!(left_seen[0]["value"], 42);
    assert_eq!(right_seen[0]["tags"], json!(["a"]));
}

#[tokio::test]
async fn test_skips_are_transitive_and_siblings_continue() {
    let h = Harness::new();
    // a -> b -> c fails at a; d -> e is unaffected; f needs both d and a.
    let a = h.add_step("a", StepBehavior::Fail("boom".into())).await;
    let b = h.add_step("b", StepBehavior::Succeed).await;
    let c = h.add_step("c", StepBehavior::Succeed).await;
    let d = h.add_step("d", StepBehavior::Succeed).await;
    let e = h.add_step("e", StepBehavior::Succeed).await;
    let f = h.add_step("f", StepBehavior::Succeed).await;

    let config = WiringConfiguration::new("branches")
        .with_node("a", "Step")
        .with_node("b", "Step")
        .with_node("c", "Step")
        .with_node("d", "Step")
        .with_node("e", "Step")
        .with_node("f", "Step")
        .connect("a", "out", "b", "in")
        .connect("b", "out", "c", "in")
        .connect("d", "out", "e", "in")
        .connect("d", "out", "f", "in")
        .connect("a", "out", "f", "in");
    h.engine.load_configuration(config).unwrap();

    let report = h.engine.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, names(&["a"]));
    assert_eq!(report.skipped, names(&["b", "c", "f"]));
    assert_eq!(report.completed(), vec!["d", "e"]);

    assert_eq!((a.runs(), b.runs(), c.runs()), (1, 0, 0));
    assert_eq!((d.runs(), e.runs(), f.runs()), (1, 1, 0));
    assert_eq!(
        report.record("c").unwrap().outcome,
        NodeOutcome::Skipped {
            blocked_by: vec!["b".to_string()]
        }
    );
}

#[tokio::test]
async fn test_panicking_module_is_recorded_as_failed() {
    let h = Harness::new();
    let bad = h.add_step("bad", StepBehavior::Panic).await;
    let good = h.add_step("good", StepBehavior::Succeed).await;
    let config = WiringConfiguration::new("panic")
        .with_node("bad", "Step")
        .with_node("good", "Step");
    h.engine.load_configuration(config).unwrap();

    let report = h.engine.execute(CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, names(&["bad"]));
    assert_eq!(good.runs(), 1);
    assert_eq!(bad.state(), ModuleState::Error);
}

#[tokio::test]
async fn test_cycle_is_fatal_to_load() {
    let h = Harness::new();
    let baseline = h.bus.subscription_count();
    h.engine.load_configuration(chat_config()).unwrap();
    assert_eq!(h.bus.subscription_count(), baseline + 2);

    let cyclic = WiringConfiguration::new("loop")
        .with_node("a", "Step")
        .with_node("b", "Step")
        .with_node("c", "Step")
        .connect("a", "out", "b", "in")
        .connect("b", "out", "c", "in")
        .connect("c", "out", "a", "in");
    let err = h.engine.load_configuration(cyclic).unwrap_err();

    assert!(matches!(
        err,
        WiringError::Topology(GraphError::Cycle { ordered: 0, total: 3 })
    ));
    assert!(err.to_string().contains("circular"));
    assert!(err.to_string().contains("0/3"));
    assert_eq!(h.engine.status(), EngineStatus::Unloaded);
    assert_eq!(h.bus.subscription_count(), baseline);
    assert!(matches!(
        h.engine.execute(CancellationToken::new()).await,
        Err(WiringError::NotLoaded)
    ));
}

#[tokio::test]
async fn test_unload_disposes_routes() {
    let h = Harness::new();
    let baseline = h.bus.subscription_count();
    h.engine.load_configuration(chat_config()).unwrap();
    assert!(h.engine.unload_configuration());
    assert_eq!(h.bus.subscription_count(), baseline);
    assert!(!h.engine.unload_configuration());
    assert_eq!(h.engine.current_configuration(), None);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_skips_remaining_levels() {
    let h = Harness::new();
    h.add_step("slow", StepBehavior::Sleep(Duration::from_secs(30))).await;
    let next = h.add_step("next", StepBehavior::Succeed).await;
    let config = WiringConfiguration::new("cancel")
        .with_node("slow", "Step")
        .with_node("next", "Step")
        .connect("slow", "out", "next", "in");
    h.engine.load_configuration(config).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = h.engine.execute(cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.failed, names(&["slow"]));
    assert_eq!(report.skipped, names(&["next"]));
    assert_eq!(next.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_execute_is_rejected() {
    let h = Harness::new();
    h.add_step("slow", StepBehavior::Sleep(Duration::from_millis(500))).await;
    h.engine
        .load_configuration(WiringConfiguration::new("one").with_node("slow", "Step"))
        .unwrap();

    let (first, second, reload) = tokio::join!(
        h.engine.execute(CancellationToken::new()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.engine.execute(CancellationToken::new()).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.engine
                .load_configuration(WiringConfiguration::new("two").with_node("slow", "Step"))
        },
    );

    assert!(first.unwrap().is_success());
    assert!(matches!(second, Err(WiringError::AlreadyExecuting)));
    assert!(matches!(reload, Err(WiringError::AlreadyExecuting)));
    assert_eq!(h.engine.current_configuration().unwrap().name, "one");
}

#[tokio::test]
async fn test_unloaded_modules_stop_receiving_inputs() {
    let h = Harness::new();
    let output = ChatOutputModule::new(h.ctx("output"));
    let collector = JsonCollector::new(h.ctx("sink"));
    h.add("output", output.clone()).await;
    h.add("sink", collector.clone()).await;
    let baseline = h.bus.subscription_count();

    h.bus
        .publish(Event::text(port_event_name("output", "displayText"), "before"))
        .await;
    h.host.unload_module("output").await.unwrap();
    h.host.unload_module("sink").await.unwrap();
    assert!(h.bus.subscription_count() < baseline);

    h.bus
        .publish(Event::text(port_event_name("output", "displayText"), "after"))
        .await;
    h.bus
        .publish(Event::new(
            port_event_name("sink", "data"),
            Payload::Json(json!({ "late": true })),
        ))
        .await;
    assert_eq!(output.received().await, vec!["before".to_string()]);
    assert!(collector.seen().await.is_empty());
}
