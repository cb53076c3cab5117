use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::LoadError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// `manifest.json` at the root of every plugin directory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    /// Path of the entry artifact, relative to the plugin directory.
    #[serde(rename = "entryAssembly")]
    pub entry_artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PluginManifest {
    pub fn load(dir: &Path) -> Result<Self, LoadError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(LoadError::ManifestNotFound(path));
        }
        let raw = fs::read_to_string(&path).map_err(|e| LoadError::ManifestInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let manifest: PluginManifest =
            serde_json::from_str(&raw).map_err(|e| LoadError::ManifestInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        manifest.validate().map_err(|reason| LoadError::ManifestInvalid { path, reason })?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("entryAssembly", &self.entry_artifact),
        ] {
            if value.trim().is_empty() {
                return Err(format!("`{}` must not be empty", field));
            }
        }
        let inside = Path::new(&self.entry_artifact)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !inside || self.entry_artifact.contains('\\') {
            return Err(format!(
                "`entryAssembly` must stay inside the plugin directory, got `{}`",
                self.entry_artifact
            ));
        }
        Ok(())
    }

    pub fn entry_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.entry_artifact)
    }
}
