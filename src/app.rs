use std::sync::Arc;

use anyhow::{Context, Result};
use module_plugin::ModuleFactory;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bus::EventBus,
    config::RuntimeConfig,
    heartbeat::HeartbeatLoop,
    logger::RuntimeMetrics,
    plugin::{LoadResult, ModuleHost, PluginRegistry, SharedContracts},
    port::PortRegistry,
    watcher::{DEFAULT_POLL_INTERVAL, DirectoryWatcher, PluginDirWatcher},
    wiring::{ConfigurationStore, ExecutionReport, WiringEngine, WiringError},
};

/// A compiled-in module registered under a fixed id at startup.
#[derive(Clone)]
pub struct Builtin {
    pub id: String,
    pub factory: Arc<dyn ModuleFactory>,
}

impl Builtin {
    pub fn new(id: impl Into<String>, factory: Arc<dyn ModuleFactory>) -> Self {
        Self {
            id: id.into(),
            factory,
        }
    }
}

/// The assembled runtime.
pub struct App {
    config: RuntimeConfig,
    cancel: CancellationToken,
    bus: Arc<EventBus>,
    host: Arc<ModuleHost>,
    engine: Arc<WiringEngine>,
    store: ConfigurationStore,
    heartbeat: HeartbeatLoop,
    watcher: Option<DirectoryWatcher>,
    scan_report: Vec<LoadResult>,
    resumed: Option<String>,
}

impl App {
    /// Wire everything together, load plugins and built-ins, resume the last
    /// configuration when enabled, then start the heartbeat and the plugin watcher.
    pub async fn bootstrap(config: RuntimeConfig, builtins: Vec<Builtin>) -> Result<App> {
        config
            .ensure_layout()
            .with_context(|| format!("preparing {}", config.root.display()))?;

        let metrics = RuntimeMetrics::new();
        let cancel = CancellationToken::new();
        let bus = Arc::new(EventBus::with_compaction_interval(config.compaction_interval));
        let ports = Arc::new(PortRegistry::new());
        let registry = Arc::new(PluginRegistry::new());
        let host = Arc::new(ModuleHost::new(
            Arc::new(SharedContracts::default()),
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&ports),
        ));
        let engine = Arc::new(
            WiringEngine::new(Arc::clone(&bus), Arc::clone(&ports)).with_metrics(metrics.clone()),
        );
        let store = ConfigurationStore::new(config.configs_dir());

        let scan_report = host.scan(&config.plugins_dir()).await;
        for builtin in &builtins {
            host.add_builtin(&builtin.id, builtin.factory.as_ref())
                .await
                .with_context(|| format!("adding built-in module `{}`", builtin.id))?;
        }

        let resumed = if config.auto_resume {
            match engine.resume_last(&store) {
                Ok(name) => name,
                Err(e) => {
                    warn!("could not resume the last configuration: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let heartbeat = HeartbeatLoop::new(registry, Arc::clone(&bus), config.heartbeat.clone())
            .with_metrics(metrics);
        heartbeat.start(&cancel)?;

        let watcher = match PluginDirWatcher::new(Arc::clone(&host), config.plugins_dir())
            .watch(DEFAULT_POLL_INTERVAL)
            .await
        {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("plugin hot discovery disabled: {:#}", e);
                None
            }
        };

        info!(
            root = %config.root.display(),
            plugins = scan_report.iter().filter(|r| r.is_success()).count(),
            builtins = builtins.len(),
            resumed = ?resumed,
            "modwire started"
        );
        Ok(App {
            config,
            cancel,
            bus,
            host,
            engine,
            store,
            heartbeat,
            watcher,
            scan_report,
            resumed,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn host(&self) -> &Arc<ModuleHost> {
        &self.host
    }

    pub fn engine(&self) -> &Arc<WiringEngine> {
        &self.engine
    }

    pub fn store(&self) -> &ConfigurationStore {
        &self.store
    }

    pub fn heartbeat(&self) -> &HeartbeatLoop {
        &self.heartbeat
    }

    /// Load results from the startup plugin scan.
    pub fn scan_report(&self) -> &[LoadResult] {
        &self.scan_report
    }

    /// Name of the configuration restored at startup.
    pub fn resumed(&self) -> Option<&str> {
        self.resumed.as_deref()
    }

    /// Load a stored configuration by name and mark it for auto-resume.
    pub fn load(&self, name: &str) -> Result<Vec<Vec<String>>, WiringError> {
        self.engine.load_named(&self.store, name)
    }

    /// Run the loaded configuration once. Shutdown cancels it.
    pub async fn execute(&self) -> Result<ExecutionReport, WiringError> {
        self.engine.execute(self.cancel.child_token()).await
    }

    /// Stop in reverse start order: watcher, heartbeat, wiring, modules.
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        self.cancel.cancel();
        self.heartbeat.stop().await;
        self.engine.unload_configuration();
        self.host.shutdown_all().await;
        info!("modwire stopped");
    }
}
