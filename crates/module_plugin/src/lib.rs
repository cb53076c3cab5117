// module_plugin/src/lib.rs
//
// The contract every modwire module is written against. This crate is linked once
// into the host and shared by every plugin, so type identity holds across plugins.

pub mod bus;
pub mod error;
pub mod event;
pub mod module;
pub mod port;
pub mod state;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use bus::{
    BusError, EventHandler, MessageBus, RequestHandler, SubscriptionFilter, SubscriptionHandle,
    handler_fn, request_fn,
};
pub use error::ModuleError;
pub use event::{DataKind, Event, Payload, execute_event_name, port_event_name};
pub use module::{
    ExecutableModule, Module, ModuleContext, ModuleFactory, ModuleInfo, TickableModule, factory_fn,
};
pub use port::{Port, PortDirection, PortSpec};
pub use state::{ModuleState, StateTracker};

pub use tokio_util::sync::CancellationToken;
