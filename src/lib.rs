//! Runtime for sandboxed plugin modules wired together through typed ports.
//!
//! Modules publish and consume [`module_plugin::Event`]s on an [`bus::EventBus`].
//! A [`wiring::WiringConfiguration`] connects output ports to input ports; the
//! [`wiring::WiringEngine`] routes data along those connections and executes
//! modules level by level. Tickable modules are driven by the
//! [`heartbeat::HeartbeatLoop`], and WebAssembly plugins are loaded through
//! [`plugin::ModuleHost`].

pub mod app;
pub mod bus;
pub mod config;
pub mod graph;
pub mod heartbeat;
pub mod logger;
pub mod plugin;
pub mod port;
pub mod schema;
pub mod watcher;
pub mod wiring;
