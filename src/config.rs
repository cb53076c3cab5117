use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{bus::DEFAULT_COMPACTION_INTERVAL, heartbeat::HeartbeatConfig, logger::LogConfig};

pub const HEARTBEAT_MS: &str = "MODWIRE_HEARTBEAT_MS";
pub const LATENCY_RATIO: &str = "MODWIRE_LATENCY_RATIO";
pub const COMPACTION_INTERVAL: &str = "MODWIRE_COMPACTION_INTERVAL";
pub const AUTO_RESUME: &str = "MODWIRE_AUTO_RESUME";
pub const LOG_LEVEL: &str = "MODWIRE_LOG_LEVEL";
pub const OTEL_ENDPOINT: &str = "MODWIRE_OTEL_ENDPOINT";

const RUNTIME_KEYS: [&str; 6] = [
    HEARTBEAT_MS,
    LATENCY_RATIO,
    COMPACTION_INTERVAL,
    AUTO_RESUME,
    LOG_LEVEL,
    OTEL_ENDPOINT,
];

pub fn is_runtime_key(key: &str) -> bool {
    RUNTIME_KEYS.contains(&key)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value} is invalid: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("could not update {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A key/value settings source.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    async fn del(&self, key: &str);

    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                pairs.push((key, value));
            }
        }
        pairs
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn describe(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn env(env_file: impl Into<PathBuf>) -> Self {
        Self(EnvConfigManager::new(env_file.into()))
    }

    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let manager = MapConfigManager::new();
        for (k, v) in pairs {
            manager.map.insert(k.into(), v.into());
        }
        Self(manager)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    /// Parse `key` if present; blank values count as absent.
    pub async fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.get(key).await else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
    }

    /// Store `key=value`. Runtime keys are checked the way startup reads them,
    /// so a bad value is refused here rather than at the next start.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        if is_runtime_key(key) {
            let candidate = ConfigManager::map([(key, value)]);
            RuntimeConfig::from_manager(PathBuf::new(), &candidate).await?;
        }
        self.0.set(key, value).await
    }

    pub async fn del(&self, key: &str) {
        self.0.del(key).await
    }

    /// `MODWIRE_*` settings, sorted by key.
    pub async fn settings(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .0
            .as_vec()
            .await
            .into_iter()
            .filter(|(k, _)| k.starts_with("MODWIRE_"))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.describe())
    }
}

/// Process environment, seeded from a `.env` file. Writes go to both.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        match dotenvy::from_path(&env_file) {
            Ok(()) => info!("loaded environment from {}", env_file.display()),
            Err(e) if e.not_found() => debug!("no env file at {}", env_file.display()),
            Err(e) => warn!("could not read {}: {}", env_file.display(), e),
        }
        Box::new(Self { env_file })
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();
        for line in content.lines() {
            let matches = line.split_once('=').is_some_and(|(k, _)| k.trim() == key);
            if !matches {
                lines.push(line.to_string());
            } else if let Some(value) = value {
                if !replaced {
                    lines.push(format!("{key}={value}"));
                    replaced = true;
                }
            }
        }
        if let (Some(value), false) = (value, replaced) {
            lines.push(format!("{key}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n") + "\n").map_err(|source| {
            ConfigError::Persist {
                path: self.env_file.clone(),
                source,
            }
        })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        // SAFETY: settings are written from the CLI before the runtime spawns workers.
        unsafe { env::set_var(key, value) };
        self.rewrite(key, Some(value))
    }

    async fn del(&self, key: &str) {
        // SAFETY: as in `set`.
        unsafe { env::remove_var(key) };
        if self.env_file.exists() {
            if let Err(e) = self.rewrite(key, None) {
                warn!("{}", e);
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Resolved runtime settings plus the directory layout under `root`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub heartbeat: HeartbeatConfig,
    pub compaction_interval: u64,
    pub auto_resume: bool,
    pub log: LogConfig,
}

impl RuntimeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let log = LogConfig {
            log_dir: Some(root.join("logs")),
            ..LogConfig::default()
        };
        Self {
            root,
            heartbeat: HeartbeatConfig::default(),
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            auto_resume: true,
            log,
        }
    }

    pub async fn from_manager(
        root: impl Into<PathBuf>,
        manager: &ConfigManager,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(root);

        if let Some(ms) = manager.parse::<u64>(HEARTBEAT_MS).await? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: HEARTBEAT_MS.to_string(),
                    value: ms.to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
            config.heartbeat.interval = Duration::from_millis(ms);
        }
        if let Some(ratio) = manager.parse::<f64>(LATENCY_RATIO).await? {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::Invalid {
                    key: LATENCY_RATIO.to_string(),
                    value: ratio.to_string(),
                    reason: "expected a ratio in (0, 1]".to_string(),
                });
            }
            config.heartbeat.latency_warning_ratio = ratio;
        }
        if let Some(n) = manager.parse::<u64>(COMPACTION_INTERVAL).await? {
            config.compaction_interval = n;
        }
        if let Some(flag) = manager.parse::<bool>(AUTO_RESUME).await? {
            config.auto_resume = flag;
        }
        if let Some(level) = manager.get(LOG_LEVEL).await.filter(|l| !l.trim().is_empty()) {
            config.log.log_level = level;
        }
        config.log.otel_endpoint = manager
            .get(OTEL_ENDPOINT)
            .await
            .filter(|e| !e.trim().is_empty());

        Ok(config)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.root.join("schemas")
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    /// Create the directory layout if missing.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [self.plugins_dir(), self.configs_dir(), self.schemas_dir()] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
