use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use module_plugin::{MessageBus, Module, ModuleContext};
use tracing::{info, warn};

use super::{LoadError, PluginContext, PluginManifest, SharedContracts, wasm::WasmModule};

/// Outcome of loading one plugin directory. Loading never fails by raising;
/// a failure leaves `module` empty and fills `error`.
pub struct LoadResult {
    pub directory: PathBuf,
    pub module: Option<Arc<dyn Module>>,
    pub context: Option<Arc<PluginContext>>,
    pub manifest: Option<PluginManifest>,
    pub error: Option<LoadError>,
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        self.module.is_some() && self.error.is_none()
    }

    /// Module id the plugin registers under.
    pub fn module_id(&self) -> Option<&str> {
        self.manifest.as_ref().map(|m| m.name.as_str())
    }

    pub(crate) fn failed(
        directory: &Path,
        context: Option<Arc<PluginContext>>,
        manifest: Option<PluginManifest>,
        error: LoadError,
    ) -> Self {
        Self {
            directory: directory.to_path_buf(),
            module: None,
            context,
            manifest,
            error: Some(error),
        }
    }
}

impl std::fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadResult")
            .field("directory", &self.directory)
            .field("module", &self.module.as_ref().map(|m| m.info().name))
            .field("manifest", &self.manifest)
            .field("error", &self.error)
            .finish()
    }
}

/// Turns plugin directories into initialized modules.
pub struct PluginLoader {
    shared: Arc<SharedContracts>,
    bus: Arc<dyn MessageBus>,
}

impl PluginLoader {
    pub fn new(shared: Arc<SharedContracts>, bus: Arc<dyn MessageBus>) -> Self {
        Self { shared, bus }
    }

    pub fn shared(&self) -> &Arc<SharedContracts> {
        &self.shared
    }

    /// Manifest, entry artifact, fresh context, compile, discovery,
    /// instantiation, initialization. The first failing step ends the load.
    #[tracing::instrument(name = "load_module", skip(self), fields(dir = %dir.display()))]
    pub async fn load_module(&self, dir: &Path) -> LoadResult {
        let manifest = match PluginManifest::load(dir) {
            Ok(m) => m,
            Err(e) => return self.report(LoadResult::failed(dir, None, None, e)),
        };

        let entry = manifest.entry_path(dir);
        if !entry.is_file() {
            return self.report(LoadResult::failed(
                dir,
                None,
                Some(manifest),
                LoadError::EntryNotFound(entry),
            ));
        }

        let context = Arc::new(PluginContext::new(&manifest.name, dir, Arc::clone(&self.shared)));
        let fail = |error: LoadError, manifest: PluginManifest| {
            LoadResult::failed(dir, Some(Arc::clone(&context)), Some(manifest), error)
        };

        let artifact = match context.load_entry(&entry) {
            Ok(a) => a,
            Err(e) => return self.report(fail(e, manifest)),
        };

        let ctx = ModuleContext::new(manifest.name.clone(), Arc::clone(&self.bus));
        let module = match WasmModule::instantiate(&context, &artifact, &entry, ctx) {
            Ok(m) => m,
            Err(e) => return self.report(fail(e, manifest)),
        };

        if let Err(e) = module.initialize().await {
            return self.report(fail(LoadError::Initialization(e.to_string()), manifest));
        }

        info!(
            plugin = %manifest.name,
            version = %manifest.version,
            type_name = module.type_name(),
            "plugin loaded"
        );
        LoadResult {
            directory: dir.to_path_buf(),
            module: Some(module),
            context: Some(context),
            manifest: Some(manifest),
            error: None,
        }
    }

    /// Load every immediate subdirectory of `path`, in name order.
    /// One bad plugin never stops the others.
    pub async fn scan_directory(&self, path: &Path) -> Vec<LoadResult> {
        let mut dirs: Vec<PathBuf> = match fs::read_dir(path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(e) => {
                warn!("cannot scan plugin directory {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        dirs.sort();

        let mut results = Vec::with_capacity(dirs.len());
        for dir in dirs {
            results.push(self.load_module(&dir).await);
        }
        results
    }

    fn report(&self, result: LoadResult) -> LoadResult {
        if let Some(err) = &result.error {
            warn!(dir = %result.directory.display(), "plugin failed to load: {}", err);
        }
        result
    }
}
