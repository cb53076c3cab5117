use std::{
    panic::AssertUnwindSafe,
    path::Path,
    sync::{Arc, Weak},
};

use anyhow::anyhow;
use dashmap::DashMap;
use futures::FutureExt;
use module_plugin::{
    DataKind, ExecutableModule, MessageBus, Module, ModuleContext, ModuleError, ModuleFactory,
    SubscriptionFilter, SubscriptionHandle, execute_event_name, handler_fn,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    LoadError, LoadResult, ModuleRegistration, PluginContext, PluginLoader, PluginManifest,
    PluginRegistry, RegistryError, SharedContracts,
};
use crate::{bus::EventBus, bus::panic_message, port::PortRegistry};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown module `{0}`")]
    UnknownModule(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("module `{id}`: {source}")]
    Module {
        id: String,
        #[source]
        source: ModuleError,
    },
}

/// Admits modules into the registry and keeps their ports and execute
/// dispatchers in step with it.
pub struct ModuleHost {
    loader: PluginLoader,
    registry: Arc<PluginRegistry>,
    ports: Arc<PortRegistry>,
    bus: Arc<EventBus>,
    dispatchers: DashMap<String, SubscriptionHandle>,
}

impl ModuleHost {
    pub fn new(
        shared: Arc<SharedContracts>,
        bus: Arc<EventBus>,
        registry: Arc<PluginRegistry>,
        ports: Arc<PortRegistry>,
    ) -> Self {
        let dyn_bus: Arc<dyn MessageBus> = bus.clone();
        Self {
            loader: PluginLoader::new(shared, dyn_bus),
            registry,
            ports,
            bus,
            dispatchers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Context for a module constructed outside the loader.
    pub fn context_for(&self, id: &str) -> ModuleContext {
        let bus: Arc<dyn MessageBus> = self.bus.clone();
        ModuleContext::new(id, bus)
    }

    pub async fn load_directory(&self, dir: &Path) -> LoadResult {
        let result = self.loader.load_module(dir).await;
        self.admit_result(result).await
    }

    pub async fn scan(&self, path: &Path) -> Vec<LoadResult> {
        let mut admitted = Vec::new();
        for result in self.loader.scan_directory(path).await {
            admitted.push(self.admit_result(result).await);
        }
        let loaded = admitted.iter().filter(|r| r.is_success()).count();
        info!(dir = %path.display(), loaded, total = admitted.len(), "plugin scan finished");
        admitted
    }

    /// Build a module from a compiled-in factory, initialize and admit it.
    pub async fn add_builtin(
        &self,
        id: &str,
        factory: &dyn ModuleFactory,
    ) -> Result<ModuleRegistration, HostError> {
        let module = factory
            .create(self.context_for(id))
            .map_err(|source| HostError::Module {
                id: id.to_string(),
                source,
            })?;
        debug!(module = id, factory = factory.module_name(), "built-in module created");
        self.add_module(id, module).await
    }

    /// Initialize and admit a module the caller already constructed.
    pub async fn add_module(
        &self,
        id: &str,
        module: Arc<dyn Module>,
    ) -> Result<ModuleRegistration, HostError> {
        if self.registry.contains(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()).into());
        }
        module.initialize().await.map_err(|source| HostError::Module {
            id: id.to_string(),
            source,
        })?;
        match self.admit(id, Arc::clone(&module), None, None) {
            Ok(registration) => Ok(registration),
            Err(e) => {
                let _ = module.shutdown().await;
                Err(e)
            }
        }
    }

    /// Register the module, its ports and, for executable modules, the
    /// `"{id}.execute"` dispatcher.
    pub fn admit(
        &self,
        id: &str,
        module: Arc<dyn Module>,
        context: Option<Arc<PluginContext>>,
        manifest: Option<PluginManifest>,
    ) -> Result<ModuleRegistration, HostError> {
        let registration = self.registry.register(id, module, context, manifest)?;
        let ports: Vec<_> = registration.module.ports().iter().map(|p| p.bind(id)).collect();
        if !ports.is_empty() {
            self.ports.register_ports(id, ports);
        }

        if let Some(executable) = &registration.executable {
            let handle = self.install_dispatcher(id, Arc::downgrade(executable));
            self.dispatchers.insert(id.to_string(), handle);
        }
        Ok(registration)
    }

    fn install_dispatcher(&self, id: &str, target: Weak<dyn ExecutableModule>) -> SubscriptionHandle {
        let module_id = id.to_string();
        let filter = SubscriptionFilter::kind(DataKind::Trigger).with_name(execute_event_name(id));
        self.bus.subscribe(
            filter,
            handler_fn(move |_event, cancel| {
                let target = target.clone();
                let module_id = module_id.clone();
                async move {
                    match target.upgrade() {
                        Some(module) => run_execute(&module_id, module, cancel).await,
                        None => Ok(()),
                    }
                }
            }),
        )
    }

    /// Run the shutdown hook, then unregister. The execution context is unloaded
    /// with the registration.
    pub async fn unload_module(&self, id: &str) -> Result<(), HostError> {
        let registration = self
            .registry
            .get(id)
            .ok_or_else(|| HostError::UnknownModule(id.to_string()))?;

        if let Some((_, handle)) = self.dispatchers.remove(id) {
            handle.dispose();
        }
        if let Err(e) = registration.module.shutdown().await {
            warn!(module = id, "shutdown hook failed: {}", e);
        }
        self.ports.unregister(id);
        self.registry.unregister(id);
        Ok(())
    }

    /// Id of the plugin loaded from `dir`, if any.
    pub fn module_for_directory(&self, dir: &Path) -> Option<String> {
        self.registry.ids().into_iter().find(|id| {
            self.registry
                .get(id)
                .and_then(|r| r.context)
                .map(|c| c.root() == dir)
                .unwrap_or(false)
        })
    }

    pub async fn shutdown_all(&self) {
        for id in self.registry.ids() {
            if let Err(e) = self.unload_module(&id).await {
                warn!(module = %id, "unload failed: {}", e);
            }
        }
    }

    async fn admit_result(&self, mut result: LoadResult) -> LoadResult {
        let id = result.module_id().map(str::to_string);
        let (Some(module), Some(id)) = (result.module.clone(), id) else {
            return result;
        };
        if let Err(e) = self.admit(&id, Arc::clone(&module), result.context.clone(), result.manifest.clone()) {
            warn!(module = %id, dir = %result.directory.display(), "plugin rejected: {}", e);
            let _ = module.shutdown().await;
            if let Some(context) = &result.context {
                context.unload();
            }
            result.module = None;
            result.error = Some(LoadError::AlreadyRegistered(id));
        }
        result
    }
}

/// Drive one execute call through the module's state tracker.
async fn run_execute(
    id: &str,
    module: Arc<dyn ExecutableModule>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let tracker = module.tracker();
    tracker.begin();
    let outcome = AssertUnwindSafe(module.execute(cancel)).catch_unwind().await;
    match outcome {
        Ok(Ok(())) => {
            tracker.complete();
            Ok(())
        }
        Ok(Err(e)) => {
            let message = e.to_string();
            tracker.fail(message.clone());
            Err(anyhow!("module `{}` failed: {}", id, message))
        }
        Err(panic) => {
            let message = panic_message(panic);
            tracker.fail(message.clone());
            Err(anyhow!("module `{}` {}", id, message))
        }
    }
}
