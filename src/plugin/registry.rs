use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use module_plugin::{ExecutableModule, Module, TickableModule};
use thiserror::Error;
use tracing::{debug, info};

use super::{PluginContext, PluginManifest};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("module `{0}` is already registered")]
    AlreadyRegistered(String),
}

/// A registered module and the capabilities probed when it was registered.
#[derive(Clone)]
pub struct ModuleRegistration {
    pub id: String,
    pub module: Arc<dyn Module>,
    pub context: Option<Arc<PluginContext>>,
    pub manifest: Option<PluginManifest>,
    pub loaded_at: DateTime<Utc>,
    pub executable: Option<Arc<dyn ExecutableModule>>,
    pub tickable: Option<Arc<dyn TickableModule>>,
}

/// The single owner of module registrations.
#[derive(Default)]
pub struct PluginRegistry {
    modules: DashMap<String, ModuleRegistration>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First registration of an id wins; a duplicate leaves it untouched.
    pub fn register(
        &self,
        id: &str,
        module: Arc<dyn Module>,
        context: Option<Arc<PluginContext>>,
        manifest: Option<PluginManifest>,
    ) -> Result<ModuleRegistration, RegistryError> {
        match self.modules.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(id.to_string())),
            Entry::Vacant(slot) => {
                let registration = ModuleRegistration {
                    id: id.to_string(),
                    executable: Arc::clone(&module).as_executable(),
                    tickable: Arc::clone(&module).as_tickable(),
                    module,
                    context,
                    manifest,
                    loaded_at: Utc::now(),
                };
                debug!(
                    module = id,
                    executable = registration.executable.is_some(),
                    tickable = registration.tickable.is_some(),
                    "module registered"
                );
                slot.insert(registration.clone());
                Ok(registration)
            }
        }
    }

    /// Remove the module and unload its execution context.
    /// Returns `false` when the id is unknown.
    pub fn unregister(&self, id: &str) -> bool {
        match self.modules.remove(id) {
            Some((_, registration)) => {
                if let Some(context) = &registration.context {
                    context.unload();
                }
                info!(module = id, "module unregistered");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ModuleRegistration> {
        self.modules.get(id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn tickables(&self) -> Vec<(String, Arc<dyn TickableModule>)> {
        self.modules
            .iter()
            .filter_map(|r| r.tickable.clone().map(|t| (r.key().clone(), t)))
            .collect()
    }

    pub fn executables(&self) -> Vec<(String, Arc<dyn ExecutableModule>)> {
        self.modules
            .iter()
            .filter_map(|r| r.executable.clone().map(|e| (r.key().clone(), e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use module_plugin::testing::{StepBehavior, StepModule, TickProbe};

    #[test]
    fn test_duplicate_registration_keeps_original() {
        let registry = PluginRegistry::new();
        let first: Arc<dyn Module> = StepModule::new(StepBehavior::Succeed);
        let second: Arc<dyn Module> = TickProbe::counter();

        registry.register("m", Arc::clone(&first), None, None).unwrap();
        assert_eq!(
            registry.register("m", second, None, None).err().unwrap(),
            RegistryError::AlreadyRegistered("m".into())
        );

        let kept = registry.get("m").unwrap();
        assert!(Arc::ptr_eq(&kept.module, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capabilities_are_cached() {
        let registry = PluginRegistry::new();
        registry
            .register("step", StepModule::new(StepBehavior::Succeed), None, None)
            .unwrap();
        registry.register("tick", TickProbe::counter(), None, None).unwrap();

        let tickables: Vec<String> = registry.tickables().into_iter().map(|(id, _)| id).collect();
        let executables: Vec<String> = registry.executables().into_iter().map(|(id, _)| id).collect();
        assert_eq!(tickables, vec!["tick".to_string()]);
        assert_eq!(executables, vec!["step".to_string()]);
    }

    #[test]
    fn test_unregister_unknown_is_false() {
        let registry = PluginRegistry::new();
        assert!(!registry.unregister("ghost"));
        registry.register("m", TickProbe::counter(), None, None).unwrap();
        assert!(registry.unregister("m"));
        assert!(registry.is_empty());
        assert!(registry.tickables().is_empty());
    }
}
