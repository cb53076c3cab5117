use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{EventHandler, MessageBus, SubscriptionFilter, SubscriptionHandle},
    error::ModuleError,
    event::{DataKind, Event, Payload, port_event_name},
    port::PortSpec,
    state::{ModuleState, StateTracker},
};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The lifecycle every module implements.
///
/// Optional capabilities are exposed through [`Module::as_executable`] and
/// [`Module::as_tickable`]. The host probes them once, when the module is
/// registered, and caches the result.
#[async_trait]
pub trait Module: Send + Sync {
    fn info(&self) -> ModuleInfo;

    /// Declared ports. Read once at registration.
    fn ports(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    async fn initialize(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        None
    }

    fn as_tickable(self: Arc<Self>) -> Option<Arc<dyn TickableModule>> {
        None
    }
}

/// A module that runs once per wiring execution.
#[async_trait]
pub trait ExecutableModule: Module {
    async fn execute(&self, cancel: CancellationToken) -> Result<(), ModuleError>;

    fn tracker(&self) -> &StateTracker;

    fn state(&self) -> ModuleState {
        self.tracker().state()
    }

    fn last_error(&self) -> Option<String> {
        self.tracker().last_error()
    }
}

/// A module driven by the heartbeat.
#[async_trait]
pub trait TickableModule: Module {
    async fn tick(&self, cancel: CancellationToken) -> Result<(), ModuleError>;
}

/// Everything a module gets at construction time.
#[derive(Clone)]
pub struct ModuleContext {
    pub module_id: String,
    pub bus: Arc<dyn MessageBus>,
}

impl ModuleContext {
    pub fn new(module_id: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            module_id: module_id.into(),
            bus,
        }
    }

    /// Publish `payload` on one of this module's ports.
    pub async fn publish_port(&self, port: &str, payload: Payload) {
        let event = Event::new(port_event_name(&self.module_id, port), payload)
            .from_source(self.module_id.clone());
        self.bus.publish(event).await;
    }

    /// Publish a null payload that still carries the port's kind.
    pub async fn publish_port_null(&self, port: &str, kind: DataKind) {
        let event = Event::null(port_event_name(&self.module_id, port), kind)
            .from_source(self.module_id.clone());
        self.bus.publish(event).await;
    }

    /// Listen on one of this module's input ports.
    pub fn subscribe_port(
        &self,
        port: &str,
        kind: DataKind,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let filter = SubscriptionFilter::kind(kind).with_name(port_event_name(&self.module_id, port));
        self.bus.subscribe(filter, handler)
    }
}

/// Creates module instances of one type, used for modules compiled into the host.
pub trait ModuleFactory: Send + Sync {
    fn module_name(&self) -> &str;

    fn create(&self, ctx: ModuleContext) -> Result<Arc<dyn Module>, ModuleError>;
}

pub struct FnFactory<F> {
    name: String,
    f: F,
}

impl<F> ModuleFactory for FnFactory<F>
where
    F: Fn(ModuleContext) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync,
{
    fn module_name(&self) -> &str {
        &self.name
    }

    fn create(&self, ctx: ModuleContext) -> Result<Arc<dyn Module>, ModuleError> {
        (self.f)(ctx)
    }
}

pub fn factory_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn ModuleFactory>
where
    F: Fn(ModuleContext) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync + 'static,
{
    Arc::new(FnFactory {
        name: name.into(),
        f,
    })
}
