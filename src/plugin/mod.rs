use std::path::PathBuf;

use thiserror::Error;

pub mod context;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod wasm;

pub use context::{PluginContext, SharedContracts};
pub use host::{HostError, ModuleHost};
pub use loader::{LoadResult, PluginLoader};
pub use manifest::{MANIFEST_FILE, PluginManifest};
pub use registry::{ModuleRegistration, PluginRegistry, RegistryError};

/// Why a plugin could not be loaded. Carried inside a [`LoadResult`], never raised.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadError {
    #[error("manifest not found at {0}")]
    ManifestNotFound(PathBuf),

    #[error("invalid manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("entry artifact not found at {0}")]
    EntryNotFound(PathBuf),

    #[error("failed to compile {path}: {reason}")]
    Compile { path: PathBuf, reason: String },

    #[error("no module implementation exported by {0}")]
    NoImplementation(PathBuf),

    #[error("module type `{0}` has no `new` constructor")]
    MissingConstructor(String),

    #[error("constructor of `{type_name}` failed: {reason}")]
    ConstructorFailed { type_name: String, reason: String },

    #[error("invalid metadata from `{type_name}`: {reason}")]
    Metadata { type_name: String, reason: String },

    #[error("plugin `{plugin}` depends on `{name}`, which is neither private nor shared")]
    UnresolvedDependency { plugin: String, name: String },

    #[error("instantiation failed: {0}")]
    Instantiation(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("execution context `{0}` has been unloaded")]
    ContextUnloaded(String),

    #[error("module `{0}` is already registered")]
    AlreadyRegistered(String),
}
