//! WebAssembly adapter: turns an instantiated core module into a [`Module`].
//!
//! ABI, all strings NUL-terminated in the plugin's exported `memory`:
//!
//! * a module type `T` exists when `T.info`, `T.init` and `T.shutdown` are exported
//! * `T.new() -> handle`, negative handle means the constructor failed
//! * `T.info(handle) -> ptr` to a JSON document `{name, version, description, ports}`
//! * `T.init(handle)`, `T.shutdown(handle)`, `T.execute(handle)`, `T.tick(handle)`
//!   return 0 on success
//! * `T.input(handle, port_ptr, payload_ptr)` receives input-port events; it needs
//!   an exported `alloc(len) -> ptr` so the host can write the strings
//!
//! Host functions live in the `modwire` import module: `log(level, msg)`,
//! `publish_text(port, text)`, `publish_json(port, json)`,
//! `publish_number(port, f64)` and `publish_trigger(port)`.

use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex, Weak},
};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use module_plugin::{
    ExecutableModule, Module, ModuleContext, ModuleError, ModuleInfo, Payload, PortDirection,
    PortSpec, StateTracker, SubscriptionHandle, TickableModule, handler_fn,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, ExternType, Linker, Memory, Module as WasmArtifact, Store, TypedFunc};

use super::{LoadError, context::HOST_MODULE, PluginContext};

struct Outgoing {
    port: String,
    payload: Payload,
}

/// Per-plugin store data.
pub struct HostState {
    module_id: String,
    outbox: Vec<Outgoing>,
}

#[derive(Debug, Deserialize)]
struct WasmInfo {
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    ports: Vec<PortSpec>,
}

struct Hooks {
    init: TypedFunc<i32, i32>,
    shutdown: TypedFunc<i32, i32>,
    execute: Option<TypedFunc<i32, i32>>,
    tick: Option<TypedFunc<i32, i32>>,
    input: Option<TypedFunc<(i32, i32, i32), i32>>,
    alloc: Option<TypedFunc<i32, i32>>,
    memory: Option<Memory>,
}

pub struct WasmModule {
    type_name: String,
    handle: i32,
    info: ModuleInfo,
    ports: Vec<PortSpec>,
    ctx: ModuleContext,
    store: Arc<Mutex<Store<HostState>>>,
    hooks: Hooks,
    tracker: StateTracker,
    inputs: Mutex<Vec<SubscriptionHandle>>,
    me: Weak<WasmModule>,
}

/// Module types exported by `artifact`, in export order.
pub fn discover_types(artifact: &WasmArtifact) -> Vec<String> {
    let funcs: HashSet<String> = artifact
        .exports()
        .filter(|e| matches!(e.ty(), ExternType::Func(_)))
        .map(|e| e.name().to_string())
        .collect();

    let mut types: Vec<String> = Vec::new();
    for export in artifact.exports() {
        let Some(prefix) = export.name().strip_suffix(".info") else {
            continue;
        };
        let complete = funcs.contains(export.name())
            && funcs.contains(&format!("{}.init", prefix))
            && funcs.contains(&format!("{}.shutdown", prefix));
        if complete && !types.iter().any(|t| t == prefix) {
            types.push(prefix.to_string());
        }
    }
    types
}

impl WasmModule {
    /// Instantiate the first module type found in `artifact` inside its own store.
    /// Imports other than the host module are resolved through `context`.
    pub fn instantiate(
        context: &PluginContext,
        artifact: &WasmArtifact,
        source: &Path,
        ctx: ModuleContext,
    ) -> Result<Arc<WasmModule>, LoadError> {
        let types = discover_types(artifact);
        let type_name = match types.as_slice() {
            [] => return Err(LoadError::NoImplementation(source.to_path_buf())),
            [only] => only.clone(),
            [first, rest @ ..] => {
                warn!(
                    plugin = context.name(),
                    chosen = %first,
                    ignored = ?rest,
                    "artifact exports several module types, using the first"
                );
                first.clone()
            }
        };

        let engine = context.engine();
        let mut store = Store::new(
            engine,
            HostState {
                module_id: ctx.module_id.clone(),
                outbox: Vec::new(),
            },
        );
        let mut linker: Linker<HostState> = Linker::new(engine);
        define_host_functions(&mut linker)
            .map_err(|e| LoadError::Instantiation(format!("{:#}", e)))?;

        let mut linked = HashSet::new();
        link_dependencies(context, artifact, &mut linker, &mut store, &mut linked)?;

        let instance = linker
            .instantiate(&mut store, artifact)
            .map_err(|e| LoadError::Instantiation(format!("{:#}", e)))?;

        let ctor_name = format!("{}.new", type_name);
        if instance.get_func(&mut store, &ctor_name).is_none() {
            return Err(LoadError::MissingConstructor(type_name));
        }
        let ctor = instance
            .get_typed_func::<(), i32>(&mut store, &ctor_name)
            .map_err(|e| LoadError::ConstructorFailed {
                type_name: type_name.clone(),
                reason: format!("{:#}", e),
            })?;
        let handle = ctor
            .call(&mut store, ())
            .map_err(|e| LoadError::ConstructorFailed {
                type_name: type_name.clone(),
                reason: format!("{:#}", e),
            })?;
        if handle < 0 {
            return Err(LoadError::ConstructorFailed {
                type_name,
                reason: format!("returned handle {}", handle),
            });
        }

        let metadata = |reason: String| LoadError::Metadata {
            type_name: type_name.clone(),
            reason,
        };
        let hook = |store: &mut Store<HostState>, suffix: &str| {
            instance
                .get_typed_func::<i32, i32>(&mut *store, &format!("{}.{}", type_name, suffix))
                .map_err(|e| format!("{}.{}: {:#}", type_name, suffix, e))
        };

        let memory = instance.get_memory(&mut store, "memory");
        let info_fn = hook(&mut store, "info").map_err(metadata)?;
        let info_ptr = info_fn
            .call(&mut store, handle)
            .map_err(|e| metadata(format!("{:#}", e)))?;
        let memory_ref = memory.ok_or_else(|| metadata("module exports no memory".into()))?;
        let raw = read_cstr(memory_ref.data(&store), info_ptr).map_err(|e| metadata(format!("{:#}", e)))?;
        let described: WasmInfo =
            serde_json::from_str(&raw).map_err(|e| metadata(e.to_string()))?;

        let init = hook(&mut store, "init").map_err(metadata)?;
        let shutdown = hook(&mut store, "shutdown").map_err(metadata)?;
        let execute = hook(&mut store, "execute").ok();
        let tick = hook(&mut store, "tick").ok();
        let input = instance
            .get_typed_func::<(i32, i32, i32), i32>(&mut store, &format!("{}.input", type_name))
            .ok();
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc").ok();
        if input.is_some() && alloc.is_none() {
            warn!(plugin = context.name(), "`{}.input` is exported without `alloc`; inputs are ignored", type_name);
        }

        debug!(
            plugin = context.name(),
            module = %ctx.module_id,
            type_name = %type_name,
            executable = execute.is_some(),
            tickable = tick.is_some(),
            "instantiated wasm module"
        );

        let info = ModuleInfo {
            name: described.name,
            version: described.version,
            description: described.description,
        };
        let hooks = Hooks {
            init,
            shutdown,
            execute,
            tick,
            input,
            alloc,
            memory,
        };

        Ok(Arc::new_cyclic(|me| WasmModule {
            type_name,
            handle,
            info,
            ports: described.ports,
            ctx,
            store: Arc::new(Mutex::new(store)),
            hooks,
            tracker: StateTracker::new(),
            inputs: Mutex::new(Vec::new()),
            me: me.clone(),
        }))
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Run one `(handle) -> status` hook off the async runtime, then publish
    /// whatever the plugin queued during the call.
    async fn call_hook(&self, func: TypedFunc<i32, i32>, name: &str) -> anyhow::Result<i32> {
        let store = Arc::clone(&self.store);
        let handle = self.handle;
        let (result, outbox) = tokio::task::spawn_blocking(move || {
            let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
            let result = func.call(&mut *store, handle);
            let outbox = std::mem::take(&mut store.data_mut().outbox);
            (result, outbox)
        })
        .await?;
        self.flush(outbox).await;
        result.with_context(|| format!("{}.{} trapped", self.type_name, name))
    }

    async fn deliver_input(&self, port: String, payload: Payload) -> anyhow::Result<()> {
        let (Some(input), Some(alloc), Some(memory)) =
            (self.hooks.input.clone(), self.hooks.alloc.clone(), self.hooks.memory)
        else {
            return Ok(());
        };
        let body = serde_json::to_string(&payload.to_json())?;
        let store = Arc::clone(&self.store);
        let handle = self.handle;
        let port_name = port.clone();

        let (result, outbox) = tokio::task::spawn_blocking(move || {
            let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
            let result = (|| -> anyhow::Result<i32> {
                let port_ptr = write_cstr(&mut store, alloc.clone(), memory, &port_name)?;
                let body_ptr = write_cstr(&mut store, alloc, memory, &body)?;
                input.call(&mut *store, (handle, port_ptr, body_ptr))
            })();
            let outbox = std::mem::take(&mut store.data_mut().outbox);
            (result, outbox)
        })
        .await?;
        self.flush(outbox).await;

        let code = result.with_context(|| format!("{}.input trapped", self.type_name))?;
        if code != 0 {
            bail!("{}.input rejected port `{}` with status {}", self.type_name, port, code);
        }
        Ok(())
    }

    async fn flush(&self, outbox: Vec<Outgoing>) {
        for out in outbox {
            self.ctx.publish_port(&out.port, out.payload).await;
        }
    }

    fn status(&self, name: &str, code: i32) -> Result<(), String> {
        if code == 0 {
            Ok(())
        } else {
            Err(format!("{}.{} returned status {}", self.type_name, name, code))
        }
    }
}

#[async_trait]
impl Module for WasmModule {
    fn info(&self) -> ModuleInfo {
        self.info.clone()
    }

    fn ports(&self) -> Vec<PortSpec> {
        self.ports.clone()
    }

    async fn initialize(&self) -> Result<(), ModuleError> {
        let code = self
            .call_hook(self.hooks.init.clone(), "init")
            .await
            .map_err(|e| ModuleError::Initialization(format!("{:#}", e)))?;
        self.status("init", code).map_err(ModuleError::Initialization)?;

        if self.hooks.input.is_none() || self.hooks.alloc.is_none() {
            return Ok(());
        }
        let mut handles = Vec::new();
        for spec in self.ports.iter().filter(|p| p.direction == PortDirection::Input) {
            let me = self.me.clone();
            let port = spec.name.clone();
            let handle = self.ctx.subscribe_port(
                &spec.name,
                spec.kind,
                handler_fn(move |event, _cancel| {
                    let me = me.clone();
                    let port = port.clone();
                    async move {
                        match me.upgrade() {
                            Some(module) => module.deliver_input(port, event.payload).await,
                            None => Ok(()),
                        }
                    }
                }),
            );
            handles.push(handle);
        }
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.extend(handles);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ModuleError> {
        if let Ok(mut inputs) = self.inputs.lock() {
            for handle in inputs.drain(..) {
                handle.dispose();
            }
        }
        let code = self
            .call_hook(self.hooks.shutdown.clone(), "shutdown")
            .await
            .map_err(|e| ModuleError::Shutdown(format!("{:#}", e)))?;
        self.status("shutdown", code).map_err(ModuleError::Shutdown)
    }

    fn as_executable(self: Arc<Self>) -> Option<Arc<dyn ExecutableModule>> {
        if self.hooks.execute.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_tickable(self: Arc<Self>) -> Option<Arc<dyn TickableModule>> {
        if self.hooks.tick.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ExecutableModule for WasmModule {
    async fn execute(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        let Some(func) = self.hooks.execute.clone() else {
            return Ok(());
        };
        let code = self
            .call_hook(func, "execute")
            .await
            .map_err(|e| ModuleError::Execution(format!("{:#}", e)))?;
        self.status("execute", code).map_err(ModuleError::Execution)
    }

    fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

#[async_trait]
impl TickableModule for WasmModule {
    async fn tick(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
        let Some(func) = self.hooks.tick.clone() else {
            return Ok(());
        };
        let code = self
            .call_hook(func, "tick")
            .await
            .map_err(|e| ModuleError::Tick(format!("{:#}", e)))?;
        self.status("tick", code).map_err(ModuleError::Tick)
    }
}

/// Instantiate every non-host import module, dependencies first, and expose
/// each instance to the linker under its import name.
fn link_dependencies(
    context: &PluginContext,
    artifact: &WasmArtifact,
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    linked: &mut HashSet<String>,
) -> Result<(), LoadError> {
    let names: Vec<String> = artifact
        .imports()
        .map(|i| i.module().to_string())
        .filter(|m| m != HOST_MODULE)
        .collect();

    for name in names {
        if !linked.insert(name.clone()) {
            continue;
        }
        let dependency = context.load(&name)?;
        link_dependencies(context, &dependency, linker, store, linked)?;
        let instance = linker
            .instantiate(&mut *store, &dependency)
            .map_err(|e| LoadError::Instantiation(format!("dependency `{}`: {:#}", name, e)))?;
        linker
            .instance(&mut *store, &name, instance)
            .map_err(|e| LoadError::Instantiation(format!("dependency `{}`: {:#}", name, e)))?;
        trace!(plugin = context.name(), dependency = %name, "linked dependency");
    }
    Ok(())
}

fn define_host_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32| -> anyhow::Result<()> {
            let message = caller_string(&mut caller, ptr)?;
            let module = caller.data().module_id.as_str();
            match level {
                0 => trace!(module, "{}", message),
                1 => debug!(module, "{}", message),
                2 => info!(module, "{}", message),
                3 => warn!(module, "{}", message),
                _ => error!(module, "{}", message),
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "publish_text",
        |mut caller: Caller<'_, HostState>, port: i32, ptr: i32| -> anyhow::Result<()> {
            let port = caller_string(&mut caller, port)?;
            let text = caller_string(&mut caller, ptr)?;
            queue(&mut caller, port, Payload::text(text));
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "publish_json",
        |mut caller: Caller<'_, HostState>, port: i32, ptr: i32| -> anyhow::Result<()> {
            let port = caller_string(&mut caller, port)?;
            let raw = caller_string(&mut caller, ptr)?;
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("invalid json published on `{}`", port))?;
            queue(&mut caller, port, Payload::Json(value));
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "publish_number",
        |mut caller: Caller<'_, HostState>, port: i32, value: f64| -> anyhow::Result<()> {
            let port = caller_string(&mut caller, port)?;
            queue(&mut caller, port, Payload::Number(value));
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "publish_trigger",
        |mut caller: Caller<'_, HostState>, port: i32| -> anyhow::Result<()> {
            let port = caller_string(&mut caller, port)?;
            queue(&mut caller, port, Payload::Trigger);
            Ok(())
        },
    )?;

    Ok(())
}

fn queue(caller: &mut Caller<'_, HostState>, port: String, payload: Payload) {
    caller.data_mut().outbox.push(Outgoing { port, payload });
}

fn caller_string(caller: &mut Caller<'_, HostState>, ptr: i32) -> anyhow::Result<String> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("module exports no memory"))?;
    read_cstr(memory.data(&*caller), ptr)
}

fn read_cstr(data: &[u8], ptr: i32) -> anyhow::Result<String> {
    let start = usize::try_from(ptr).map_err(|_| anyhow!("negative pointer {}", ptr))?;
    let tail = data
        .get(start..)
        .ok_or_else(|| anyhow!("pointer {} outside memory", ptr))?;
    let len = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| anyhow!("string at {} is not terminated", ptr))?;
    Ok(String::from_utf8(tail[..len].to_vec())?)
}

fn write_cstr(
    store: &mut Store<HostState>,
    alloc: TypedFunc<i32, i32>,
    memory: Memory,
    value: &str,
) -> anyhow::Result<i32> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    let len = i32::try_from(bytes.len())?;
    let ptr = alloc.call(&mut *store, len)?;
    let offset = usize::try_from(ptr).map_err(|_| anyhow!("alloc returned {}", ptr))?;
    memory.write(&mut *store, offset, &bytes)?;
    Ok(ptr)
}
