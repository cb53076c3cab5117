use std::{
    collections::{BTreeSet, HashSet},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use futures::future::join_all;
use module_plugin::{
    Event, MessageBus, Port, PortDirection, SubscriptionFilter, SubscriptionHandle,
    execute_event_name, handler_fn, port_event_name,
};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::EventBus,
    graph::{ConnectionGraph, GraphError},
    logger::RuntimeMetrics,
    port::{PortError, PortRegistry, PortValidator},
};

pub mod config;
pub mod report;
pub mod store;

pub use config::{ModuleNode, PortConnection, Position, Size, WiringConfiguration};
pub use report::{ExecutionReport, NodeOutcome, NodeRecord};
pub use store::{ConfigurationStore, StoreError};

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("no configuration is loaded")]
    NotLoaded,

    #[error("an execution is already in progress")]
    AlreadyExecuting,

    #[error(transparent)]
    Topology(#[from] GraphError),

    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),

    #[error("connection {connection} refers to unknown node `{module}`")]
    UnknownNode { connection: String, module: String },

    #[error("connection {connection} refers to unknown port `{port}`")]
    UnknownPort { connection: String, port: String },

    #[error("connection {connection} is invalid: {source}")]
    IncompatiblePorts {
        connection: String,
        #[source]
        source: PortError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Unloaded,
    Loaded,
    Executing,
}

/// A configuration with its derived graph and live routing subscriptions.
pub struct LoadedConfiguration {
    pub config: WiringConfiguration,
    pub graph: ConnectionGraph,
    pub levels: Vec<Vec<String>>,
    routes: Vec<SubscriptionHandle>,
}

/// Loads wiring configurations and runs them level by level.
///
/// Loading replaces the previous configuration wholesale: its routes are disposed
/// and a fresh graph is derived. Nodes run by dispatching `"{id}.execute"`; data
/// moves between them only through the routes.
pub struct WiringEngine {
    bus: Arc<EventBus>,
    ports: Arc<PortRegistry>,
    current: RwLock<Option<Arc<LoadedConfiguration>>>,
    executing: AtomicBool,
    failed: Mutex<BTreeSet<String>>,
    metrics: Option<RuntimeMetrics>,
}

struct ExecutingGuard<'a>(&'a AtomicBool);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WiringEngine {
    pub fn new(bus: Arc<EventBus>, ports: Arc<PortRegistry>) -> Self {
        Self {
            bus,
            ports,
            current: RwLock::new(None),
            executing: AtomicBool::new(false),
            failed: Mutex::new(BTreeSet::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RuntimeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn status(&self) -> EngineStatus {
        if self.executing.load(Ordering::Acquire) {
            EngineStatus::Executing
        } else if self.loaded().is_some() {
            EngineStatus::Loaded
        } else {
            EngineStatus::Unloaded
        }
    }

    pub fn current_configuration(&self) -> Option<WiringConfiguration> {
        self.loaded().map(|l| l.config.clone())
    }

    pub fn execution_levels(&self) -> Option<Vec<Vec<String>>> {
        self.loaded().map(|l| l.levels.clone())
    }

    /// Nodes that failed in the last execution.
    pub fn failed_modules(&self) -> BTreeSet<String> {
        self.failed.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// All load-time checks without touching engine state.
    pub fn validate_configuration(
        &self,
        config: &WiringConfiguration,
    ) -> Result<Vec<Vec<String>>, WiringError> {
        let (_, levels) = self.build(config)?;
        Ok(levels)
    }

    /// Replace the current configuration. On error the engine is left unloaded.
    pub fn load_configuration(
        &self,
        config: WiringConfiguration,
    ) -> Result<Vec<Vec<String>>, WiringError> {
        // Held for the whole swap so no execution can start on a half-replaced configuration.
        let _guard = self.claim()?;
        self.unload_configuration();

        let (graph, levels) = self.build(&config)?;
        let routes = config
            .connections
            .iter()
            .map(|c| self.install_route(c))
            .collect();

        info!(
            configuration = %config.name,
            nodes = config.nodes.len(),
            connections = config.connections.len(),
            levels = levels.len(),
            "wiring configuration loaded"
        );
        let loaded = Arc::new(LoadedConfiguration {
            config,
            graph,
            levels: levels.clone(),
            routes,
        });
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(loaded);
        Ok(levels)
    }

    /// Dispose routes and drop the configuration. Returns `false` when nothing
    /// was loaded.
    pub fn unload_configuration(&self) -> bool {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Ok(mut failed) = self.failed.lock() {
            failed.clear();
        }
        match previous {
            Some(loaded) => {
                for route in &loaded.routes {
                    route.dispose();
                }
                info!(configuration = %loaded.config.name, "wiring configuration unloaded");
                true
            }
            None => false,
        }
    }

    /// Load a stored configuration and remember it for the next start.
    pub fn load_named(
        &self,
        store: &ConfigurationStore,
        name: &str,
    ) -> Result<Vec<Vec<String>>, WiringError> {
        let config = store.load(name)?;
        let levels = self.load_configuration(config)?;
        store.mark_last_loaded(name)?;
        Ok(levels)
    }

    /// Reload whatever was loaded last. `Ok(None)` when nothing was.
    pub fn resume_last(&self, store: &ConfigurationStore) -> Result<Option<String>, WiringError> {
        match store.last_loaded()? {
            Some(name) => {
                self.load_named(store, &name)?;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    /// Run the loaded configuration once.
    ///
    /// Levels run strictly in order and the nodes of one level run concurrently.
    /// A node with a failed or skipped predecessor is skipped. Once `cancel` fires,
    /// no further level starts and the remaining nodes are recorded as skipped.
    #[tracing::instrument(name = "wiring_execute", skip_all)]
    pub async fn execute(&self, cancel: CancellationToken) -> Result<ExecutionReport, WiringError> {
        let _guard = self.claim()?;
        let loaded = self.loaded().ok_or(WiringError::NotLoaded)?;

        let levels = loaded.graph.execution_levels()?;
        let started = Utc::now();
        let mut records = Vec::new();
        let mut failed = BTreeSet::new();
        let mut skipped = BTreeSet::new();
        let mut cancelled = false;

        for (level_idx, level) in levels.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                for id in level {
                    records.push(NodeRecord::skipped(id, level_idx, Vec::new()));
                    skipped.insert(id.clone());
                }
                continue;
            }

            let mut runnable = Vec::new();
            for id in level {
                let blocked_by: Vec<String> = loaded
                    .graph
                    .predecessors(id)
                    .into_iter()
                    .filter(|p| failed.contains(p) || skipped.contains(p))
                    .collect();
                if blocked_by.is_empty() {
                    runnable.push(id.as_str());
                } else {
                    debug!(module = %id, ?blocked_by, "skipping node");
                    records.push(NodeRecord::skipped(id, level_idx, blocked_by));
                    skipped.insert(id.clone());
                }
            }

            let runs = runnable
                .iter()
                .map(|id| self.run_node(id, level_idx, cancel.clone()));
            for record in join_all(runs).await {
                if let NodeOutcome::Failed { error } = &record.outcome {
                    warn!(module = %record.node_id, "node failed: {}", error);
                    failed.insert(record.node_id.clone());
                }
                records.push(record);
            }
        }

        if let Ok(mut last) = self.failed.lock() {
            *last = failed.clone();
        }

        let report = ExecutionReport {
            configuration: loaded.config.name.clone(),
            records,
            failed,
            skipped,
            total: Utc::now() - started,
            cancelled,
        };
        info!(
            configuration = %report.configuration,
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.total.num_milliseconds(),
            cancelled,
            "wiring execution finished"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(&report);
        }
        Ok(report)
    }

    async fn run_node(&self, id: &str, level: usize, cancel: CancellationToken) -> NodeRecord {
        let started = Utc::now();
        let event = Event::trigger(execute_event_name(id)).from_source("wiring");
        let dispatch = self.bus.dispatch(event, cancel).await;
        let outcome = if dispatch.delivered == 0 {
            warn!(module = id, "no execute handler registered, treating as no-op");
            NodeOutcome::Completed
        } else if dispatch.is_clean() {
            NodeOutcome::Completed
        } else {
            NodeOutcome::Failed {
                error: dispatch.failure_summary(),
            }
        };
        NodeRecord {
            node_id: id.to_string(),
            level,
            started,
            finished: Utc::now(),
            outcome,
        }
    }

    /// Take the engine for an execution or a reload. Released on drop.
    fn claim(&self) -> Result<ExecutingGuard<'_>, WiringError> {
        self.executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| WiringError::AlreadyExecuting)?;
        Ok(ExecutingGuard(&self.executing))
    }

    fn loaded(&self) -> Option<Arc<LoadedConfiguration>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn build(
        &self,
        config: &WiringConfiguration,
    ) -> Result<(ConnectionGraph, Vec<Vec<String>>), WiringError> {
        let mut seen = HashSet::new();
        for node in &config.nodes {
            if !seen.insert(node.module_id.as_str()) {
                return Err(WiringError::DuplicateNode(node.module_id.clone()));
            }
        }

        for conn in &config.connections {
            for module in [&conn.source_module_id, &conn.target_module_id] {
                if !seen.contains(module.as_str()) {
                    return Err(WiringError::UnknownNode {
                        connection: conn.to_string(),
                        module: module.clone(),
                    });
                }
            }
            let source = self.resolve_port(
                config,
                conn,
                &conn.source_module_id,
                PortDirection::Output,
                &conn.source_port_name,
            )?;
            let target = self.resolve_port(
                config,
                conn,
                &conn.target_module_id,
                PortDirection::Input,
                &conn.target_port_name,
            )?;
            if let (Some(source), Some(target)) = (source, target) {
                PortValidator::validate_connection(&source, &target).map_err(|source| {
                    WiringError::IncompatiblePorts {
                        connection: conn.to_string(),
                        source,
                    }
                })?;
            }
        }

        let mut graph = ConnectionGraph::new();
        for node in &config.nodes {
            graph.add_node(&node.module_id);
        }
        for conn in &config.connections {
            graph.add_connection(&conn.source_module_id, &conn.target_module_id);
        }
        let levels = graph.execution_levels()?;
        Ok((graph, levels))
    }

    /// Ports are looked up under the node id first, then under its module name.
    /// A node whose ports are registered under neither is not checked.
    fn resolve_port(
        &self,
        config: &WiringConfiguration,
        conn: &PortConnection,
        module_id: &str,
        direction: PortDirection,
        name: &str,
    ) -> Result<Option<Port>, WiringError> {
        let module_name = config.node(module_id).map(|n| n.module_name.as_str());
        let owners = std::iter::once(module_id).chain(module_name);
        for owner in owners {
            if !self.ports.contains(owner) {
                continue;
            }
            return match self.ports.find(owner, direction, name) {
                Some(port) => Ok(Some(port.rebind(module_id))),
                None => Err(WiringError::UnknownPort {
                    connection: conn.to_string(),
                    port: format!("{}.{}.{}", module_id, direction, name),
                }),
            };
        }
        Ok(None)
    }

    fn install_route(&self, conn: &PortConnection) -> SubscriptionHandle {
        let source = port_event_name(&conn.source_module_id, &conn.source_port_name);
        let target = port_event_name(&conn.target_module_id, &conn.target_port_name);
        debug!(%source, %target, "installing route");
        let bus = Arc::downgrade(&self.bus);
        self.bus.subscribe(
            SubscriptionFilter::named(source),
            handler_fn(move |event: Event, cancel| {
                let bus = bus.clone();
                let target = target.clone();
                async move {
                    let Some(bus) = bus.upgrade() else {
                        return Ok(());
                    };
                    let mut routed = Event::with_kind(target, event.kind, event.payload.deep_copy());
                    routed.source = event.source;
                    bus.publish_with(routed, cancel).await;
                    Ok(())
                }
            }),
        )
    }
}
