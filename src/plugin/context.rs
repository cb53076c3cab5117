use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;
use wasmtime::{Engine, Module as WasmArtifact};

use super::LoadError;

pub const HOST_MODULE: &str = "modwire";
const DEPS_DIR: &str = "deps";
const ARTIFACT_EXTENSIONS: [&str; 2] = ["wasm", "wat"];

/// The one scope every plugin shares: the engine and the named libraries
/// registered by the host.
pub struct SharedContracts {
    engine: Engine,
    libraries: DashMap<String, WasmArtifact>,
}

impl Default for SharedContracts {
    fn default() -> Self {
        Self::new(Engine::default())
    }
}

impl SharedContracts {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            libraries: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn register_library(&self, name: &str, artifact: WasmArtifact) {
        self.libraries.insert(name.to_string(), artifact);
    }

    pub fn register_library_file(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        let artifact = WasmArtifact::from_file(&self.engine, path)?;
        self.register_library(name, artifact);
        Ok(())
    }

    pub fn library(&self, name: &str) -> Option<WasmArtifact> {
        self.libraries.get(name).map(|m| m.value().clone())
    }
}

/// Isolated execution context of one plugin.
///
/// Dependencies resolve from `<plugin>/deps/` first and fall back to the shared
/// libraries, so two plugins can carry different builds of the same library.
/// After [`PluginContext::unload`] every load fails and cached artifacts are gone.
pub struct PluginContext {
    id: Uuid,
    name: String,
    root: PathBuf,
    shared: Arc<SharedContracts>,
    private: DashMap<String, WasmArtifact>,
    unloaded: AtomicBool,
}

impl PluginContext {
    pub fn new(name: &str, root: &Path, shared: Arc<SharedContracts>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            root: root.to_path_buf(),
            shared,
            private: DashMap::new(),
            unloaded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn engine(&self) -> &Engine {
        self.shared.engine()
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Resolve a dependency by import module name. Names that could leave
    /// `deps/` never resolve.
    pub fn load(&self, name: &str) -> Result<WasmArtifact, LoadError> {
        self.ensure_loaded()?;
        if !is_plain_name(name) {
            warn!(context = %self.name, dependency = name, "rejected dependency name");
            return Err(LoadError::UnresolvedDependency {
                plugin: self.name.clone(),
                name: name.to_string(),
            });
        }
        if let Some(cached) = self.private.get(name) {
            return Ok(cached.value().clone());
        }

        for ext in ARTIFACT_EXTENSIONS {
            let path = self.root.join(DEPS_DIR).join(format!("{}.{}", name, ext));
            if path.is_file() {
                let artifact = self.compile(&path)?;
                debug!(context = %self.name, dependency = name, "loaded private dependency");
                self.private.insert(name.to_string(), artifact.clone());
                return Ok(artifact);
            }
        }

        self.shared
            .library(name)
            .ok_or_else(|| LoadError::UnresolvedDependency {
                plugin: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn load_entry(&self, path: &Path) -> Result<WasmArtifact, LoadError> {
        self.ensure_loaded()?;
        self.compile(path)
    }

    /// Invalidate the handle. Idempotent.
    pub fn unload(&self) {
        if !self.unloaded.swap(true, Ordering::AcqRel) {
            self.private.clear();
            debug!(context = %self.name, id = %self.id, "context unloaded");
        }
    }

    fn ensure_loaded(&self) -> Result<(), LoadError> {
        if self.is_unloaded() {
            return Err(LoadError::ContextUnloaded(self.name.clone()));
        }
        Ok(())
    }

    fn compile(&self, path: &Path) -> Result<WasmArtifact, LoadError> {
        WasmArtifact::from_file(self.shared.engine(), path).map_err(|e| LoadError::Compile {
            path: path.to_path_buf(),
            reason: format!("{:#}", e),
        })
    }
}

/// A single file-name component: no separators, no `..`, not hidden.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', ':'])
}
