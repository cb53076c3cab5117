use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use super::WiringConfiguration;

const LAST_LOADED: &str = ".last_loaded";
const EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration `{0}` not found")]
    NotFound(String),

    #[error("invalid configuration name `{0}`")]
    InvalidName(String),

    #[error("configuration `{name}` is not valid json: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Flat JSON files, one per configuration: `<dir>/{name}.json`.
#[derive(Debug, Clone)]
pub struct ConfigurationStore {
    dir: PathBuf,
}

impl ConfigurationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, EXTENSION)))
    }

    pub fn save(&self, config: &WiringConfiguration) -> Result<PathBuf, StoreError> {
        let path = self.path_of(&config.name)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, serde_json::to_string_pretty(config)?)?;
        debug!(name = %config.name, path = %path.display(), "configuration saved");
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<WiringConfiguration, StoreError> {
        let path = self.path_of(name)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
            name: name.to_string(),
            source,
        })
    }

    /// Stored configuration names, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(EXTENSION))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Returns `false` when there was nothing to delete.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                if self.last_loaded()?.as_deref() == Some(name) {
                    let _ = fs::remove_file(self.dir.join(LAST_LOADED));
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_last_loaded(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(LAST_LOADED), name)?;
        Ok(())
    }

    pub fn last_loaded(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.dir.join(LAST_LOADED)) {
            Ok(raw) => {
                let name = raw.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..");
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_list_delete() {
        let dir = TempDir::new().unwrap();
        let store = ConfigurationStore::new(dir.path().join("configs"));
        assert!(store.list().unwrap().is_empty());

        let config = WiringConfiguration::new("chat")
            .with_node("in", "ChatInput")
            .with_node("out", "ChatOutput")
            .connect("in", "userMessage", "out", "displayText");
        store.save(&config).unwrap();
        store.save(&WiringConfiguration::new("alpha")).unwrap();

        assert_eq!(store.list().unwrap(), vec!["alpha".to_string(), "chat".to_string()]);
        assert_eq!(store.load("chat").unwrap(), config);

        store.mark_last_loaded("chat").unwrap();
        assert_eq!(store.last_loaded().unwrap().as_deref(), Some("chat"));

        assert!(store.delete("chat").unwrap());
        assert!(!store.delete("chat").unwrap());
        assert_eq!(store.last_loaded().unwrap(), None);
        assert!(matches!(store.load("chat"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let store = ConfigurationStore::new("/tmp/unused");
        assert!(matches!(store.path_of("../etc"), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.path_of("a/b"), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.path_of(""), Err(StoreError::InvalidName(_))));
    }
}
