// Ready-made modules for tests. Enabled with the `test-utils` feature.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{SubscriptionHandle, handler_fn},
    error::ModuleError,
    event::{DataKind, Payload},
    module::{ExecutableModule, Module, ModuleContext, ModuleInfo, TickableModule},
    port::PortSpec,
    state::StateTracker,
};

/// The input subscription a module holds until shutdown.
#[derive(Default)]
struct InputSlot(std::sync::Mutex<Option<SubscriptionHandle>>);

impl InputSlot {
    fn hold(&self, handle: SubscriptionHandle) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(handle);
        }
    }

    fn dispose(&self) {
        if let Some(handle) = self.0.lock().ok().and_then(|mut slot| slot.take()) {
            handle.dispose();
        }
    }
}

/// Stand-in for a chat input box. `send` queues a message, `execute` emits it
/// on `userMessage`.
pub struct ChatInputModule {
    ctx: ModuleContext,
    tracker: StateTracker,
    pending: Mutex<Option<String>>,
}

impl ChatInputModule {
    pub fn new(ctx: ModuleContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tracker: StateTracker::new(),
            pending: Mutex::new(None),
        })
    }

    pub async fn send(&self, text: impl Into<String>) {
        *self.pending.lock().await = Some(text.into());
    }
}

#[async_trait]
impl Module for ChatInputModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("ChatInput", "1.0.0")
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("userMessage", DataKind::Text)]
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        Some(self)
    }
}

#[async_trait]
impl ExecutableModule for ChatInputModule {
    async fn execute(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        let pending = self.pending.lock().await.take();
        if let Some(text) = pending {
            self.ctx.publish_port("userMessage", Payload::text(text)).await;
        }
        Ok(())
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

pub type Responder = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// An LLM-shaped module: collects a `prompt`, answers on `response` when executed.
pub struct PromptModule {
    ctx: ModuleContext,
    tracker: StateTracker,
    responder: Responder,
    prompt: Arc<Mutex<Option<String>>>,
    input: InputSlot,
}

impl PromptModule {
    pub fn new<F>(ctx: ModuleContext, responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            ctx,
            tracker: StateTracker::new(),
            responder: Arc::new(responder),
            prompt: Arc::new(Mutex::new(None)),
            input: InputSlot::default(),
        })
    }

    pub fn echo(ctx: ModuleContext) -> Arc<Self> {
        Self::new(ctx, |p| Ok(format!("echo: {}", p)))
    }

    pub fn failing(ctx: ModuleContext, reason: &str) -> Arc<Self> {
        let reason = reason.to_string();
        Self::new(ctx, move |_| Err(reason.clone()))
    }
}

#[async_trait]
impl Module for PromptModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("LLM", "1.0.0").with_description("answers prompts")
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("prompt", DataKind::Text),
            PortSpec::output("response", DataKind::Text),
        ]
    }

    async fn initialize(&self) -> Result<(), ModuleError> {
        let slot = Arc::clone(&self.prompt);
        let handle = self.ctx.subscribe_port(
            "prompt",
            DataKind::Text,
            handler_fn(move |event, _cancel| {
                let slot = Arc::clone(&slot);
                async move {
                    *slot.lock().await = event.payload.as_text().map(str::to_string);
                    Ok(())
                }
            }),
        );
        self.input.hold(handle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModuleError> {
        self.input.dispose();
        Ok(())
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        Some(self)
    }
}

#[async_trait]
impl ExecutableModule for PromptModule {
    async fn execute(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        let prompt = self
            .prompt
            .lock()
            .await
            .take()
            .ok_or_else(|| ModuleError::Execution("no prompt received".into()))?;
        let response = (self.responder)(&prompt).map_err(ModuleError::Execution)?;
        self.ctx.publish_port("response", Payload::text(response)).await;
        Ok(())
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

/// Records everything arriving on `displayText`.
pub struct ChatOutputModule {
    ctx: ModuleContext,
    tracker: StateTracker,
    received: Arc<Mutex<Vec<String>>>,
    input: InputSlot,
}

impl ChatOutputModule {
    pub fn new(ctx: ModuleContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tracker: StateTracker::new(),
            received: Arc::new(Mutex::new(Vec::new())),
            input: InputSlot::default(),
        })
    }

    pub async fn received(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl Module for ChatOutputModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("ChatOutput", "1.0.0")
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("displayText", DataKind::Text)]
    }

    async fn initialize(&self) -> Result<(), ModuleError> {
        let received = Arc::clone(&self.received);
        let handle = self.ctx.subscribe_port(
            "displayText",
            DataKind::Text,
            handler_fn(move |event, _cancel| {
                let received = Arc::clone(&received);
                async move {
                    if let Some(text) = event.payload.as_text() {
                        received.lock().await.push(text.to_string());
                    }
                    Ok(())
                }
            }),
        );
        self.input.hold(handle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModuleError> {
        self.input.dispose();
        Ok(())
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        Some(self)
    }
}

#[async_trait]
impl ExecutableModule for ChatOutputModule {
    async fn execute(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        Ok(())
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

/// Emits a fixed JSON document on `data` when executed.
pub struct JsonEmitter {
    ctx: ModuleContext,
    tracker: StateTracker,
    document: Value,
}

impl JsonEmitter {
    pub fn new(ctx: ModuleContext, document: Value) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tracker: StateTracker::new(),
            document,
        })
    }
}

#[async_trait]
impl Module for JsonEmitter {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("JsonEmitter", "1.0.0")
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("data", DataKind::Json)]
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        Some(self)
    }
}

#[async_trait]
impl ExecutableModule for JsonEmitter {
    async fn execute(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        self.ctx
            .publish_port("data", Payload::Json(self.document.clone()))
            .await;
        Ok(())
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

/// Receives JSON on `data`, stamps its own id into the document it got, and
/// keeps it. Several collectors behind one emitter must never see each
/// other's stamps.
pub struct JsonCollector {
    ctx: ModuleContext,
    tracker: StateTracker,
    seen: Arc<Mutex<Vec<Value>>>,
    input: InputSlot,
}

impl JsonCollector {
    pub fn new(ctx: ModuleContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tracker: StateTracker::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
            input: InputSlot::default(),
        })
    }

    pub async fn seen(&self) -> Vec<Value> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl Module for JsonCollector {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("JsonCollector", "1.0.0")
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("data", DataKind::Json)]
    }

    async fn initialize(&self) -> Result<(), ModuleError> {
        let seen = Arc::clone(&self.seen);
        let me = self.ctx.module_id.clone();
        let handle = self.ctx.subscribe_port(
            "data",
            DataKind::Json,
            handler_fn(move |mut event, _cancel| {
                let seen = Arc::clone(&seen);
                let me = me.clone();
                async move {
                    if let Some(Value::Object(map)) = event.payload.as_json_mut() {
                        map.insert("stampedBy".into(), Value::String(me));
                    }
                    if let Some(doc) = event.payload.as_json() {
                        seen.lock().await.push(doc.clone());
                    }
                    Ok(())
                }
            }),
        );
        self.input.hold(handle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModuleError> {
        self.input.dispose();
        Ok(())
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        Some(self)
    }
}

#[async_trait]
impl ExecutableModule for JsonCollector {
    async fn execute(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        Ok(())
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

/// How a [`StepModule`] behaves when executed.
#[derive(Debug, Clone)]
pub enum StepBehavior {
    Succeed,
    Fail(String),
    Panic,
    Sleep(Duration),
}

/// A portless executable module that counts its runs.
pub struct StepModule {
    tracker: StateTracker,
    behavior: StepBehavior,
    runs: AtomicU64,
}

impl StepModule {
    pub fn new(behavior: StepBehavior) -> Arc<Self> {
        Arc::new(Self {
            tracker: StateTracker::new(),
            behavior,
            runs: AtomicU64::new(0),
        })
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Module for StepModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("Step", "1.0.0")
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        Some(self)
    }
}

#[async_trait]
impl ExecutableModule for StepModule {
    async fn execute(&self, cancel: CancellationToken) -> Result<(), ModuleError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            StepBehavior::Succeed => Ok(()),
            StepBehavior::Fail(reason) => Err(ModuleError::Execution(reason.clone())),
            StepBehavior::Panic => panic!("step module panicked"),
            StepBehavior::Sleep(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(*d) => Ok(()),
                    _ = cancel.cancelled() => Err(ModuleError::Execution("cancelled".into())),
                }
            }
        }
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

/// How a [`TickProbe`] behaves on each tick.
#[derive(Debug, Clone)]
pub enum TickBehavior {
    Count,
    Sleep(Duration),
    Fail,
    Panic,
}

/// A tickable module that counts ticks and optionally misbehaves.
pub struct TickProbe {
    behavior: TickBehavior,
    ticks: AtomicU64,
}

impl TickProbe {
    pub fn new(behavior: TickBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ticks: AtomicU64::new(0),
        })
    }

    pub fn counter() -> Arc<Self> {
        Self::new(TickBehavior::Count)
    }

    pub fn slow(per_tick: Duration) -> Arc<Self> {
        Self::new(TickBehavior::Sleep(per_tick))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Module for TickProbe {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new("TickProbe", "1.0.0")
    }

    fn as_tickable(self: Arc<Self>) -> Option<Arc<dyn TickableModule>> {
        Some(self)
    }
}

#[async_trait]
impl TickableModule for TickProbe {
    async fn tick(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            TickBehavior::Count => Ok(()),
            TickBehavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            TickBehavior::Fail => Err(ModuleError::Tick("probe failure".into())),
            TickBehavior::Panic => panic!("tick probe panicked"),
        }
    }
}
