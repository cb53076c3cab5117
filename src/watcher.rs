use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, error, info, warn};

use crate::plugin::{MANIFEST_FILE, ModuleHost};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that reacts to files appearing, changing or disappearing on disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls a directory tree and forwards relevant changes to a [`WatchedType`].
/// Dropping or [`shutdown`](Self::shutdown) stops dispatch.
pub struct DirectoryWatcher {
    dir: PathBuf,
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// With `initial_scan`, every relevant entry already in `dir` is passed to
    /// [`WatchedType::reload`] before watching starts.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            bail!("directory {} does not exist", dir.display());
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path).await;
                }
            }
        }

        let (tx, rx) = unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means the watcher is shutting down
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let dispatch = tokio::spawn(dispatch_events(rx, watched));
        info!(dir = %dir.display(), poll_ms = poll_interval.as_millis() as u64, "watching directory");
        Ok(DirectoryWatcher {
            dir,
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shutdown(self) {
        debug!(dir = %self.dir.display(), "watcher stopped");
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn dispatch_events(
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    watched: Arc<dyn WatchedType>,
) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(?e, "watcher error");
                continue;
            }
        };
        let removed = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => false,
            EventKind::Remove(_) => true,
            _ => continue,
        };
        for path in event.paths.iter().filter(|p| watched.is_relevant(p)) {
            let outcome = if removed {
                watched.on_remove(path).await
            } else {
                watched.on_create_or_modify(path).await
            };
            if let Err(e) = outcome {
                warn!(path = %path.display(), removed, "watch handler failed: {:#}", e);
            }
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path) {
    const MAX_RETRIES: usize = 3;

    for attempt in 1..=MAX_RETRIES {
        match watched.reload(path).await {
            Ok(()) => return,
            Err(e) if attempt == MAX_RETRIES => {
                error!(path = %path.display(), "initial load failed: {:#}", e);
            }
            Err(e) => {
                warn!(path = %path.display(), attempt, "initial load failed, retrying: {:#}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Hot discovery for the plugins directory: a changed `manifest.json` or
/// entry artifact (re)loads its plugin, a removed manifest unloads it.
pub struct PluginDirWatcher {
    host: Arc<ModuleHost>,
    plugins_dir: PathBuf,
}

impl PluginDirWatcher {
    pub fn new(host: Arc<ModuleHost>, plugins_dir: PathBuf) -> Self {
        Self { host, plugins_dir }
    }

    /// Start watching without an initial pass; the host scans on bootstrap.
    pub async fn watch(self, poll_interval: Duration) -> Result<DirectoryWatcher> {
        let dir = self.plugins_dir.clone();
        DirectoryWatcher::new(dir, Arc::new(self), false, poll_interval).await
    }

    /// The top-level plugin directory that `path` belongs to.
    fn plugin_dir_of(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.plugins_dir).ok()?;
        let first = relative.components().next()?;
        Some(self.plugins_dir.join(first))
    }

    async fn unload_dir(&self, dir: &Path) -> Result<bool> {
        match self.host.module_for_directory(dir) {
            Some(id) => {
                self.host.unload_module(&id).await?;
                info!(module = %id, dir = %dir.display(), "plugin unloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl WatchedType for PluginDirWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        let is_manifest = path.file_name().is_some_and(|n| n == MANIFEST_FILE);
        let is_artifact = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "wasm" || e == "wat");
        (is_manifest || is_artifact) && self.plugin_dir_of(path).is_some()
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let Some(dir) = self.plugin_dir_of(path) else {
            return Ok(());
        };
        if !dir.join(MANIFEST_FILE).is_file() {
            return Ok(());
        }
        self.unload_dir(&dir).await?;

        let result = self.host.load_directory(&dir).await;
        match &result.error {
            None => info!(module = ?result.module_id(), dir = %dir.display(), "plugin loaded"),
            Some(e) => bail!("loading {}: {}", dir.display(), e),
        }
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let Some(dir) = self.plugin_dir_of(path) else {
            return Ok(());
        };
        if dir.join(MANIFEST_FILE).is_file() {
            // an artifact went away but the plugin is still declared
            return self.on_create_or_modify(path).await;
        }
        self.unload_dir(&dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        created: AtomicUsize,
        removed: AtomicUsize,
        seen: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl WatchedType for Recorder {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "txt")
        }

        async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for(counter: &AtomicUsize) -> bool {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) > 0 {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_scan_and_changes() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("existing.txt"), "a").unwrap();
        std::fs::write(tmp.path().join("ignored.bin"), "b").unwrap();

        let recorder = Arc::new(Recorder::default());
        let watcher = DirectoryWatcher::new(
            tmp.path().to_path_buf(),
            recorder.clone(),
            true,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_eq!(recorder.created.load(Ordering::SeqCst), 1);

        recorder.created.store(0, Ordering::SeqCst);
        let fresh = tmp.path().join("fresh.txt");
        std::fs::write(&fresh, "c").unwrap();
        assert!(wait_for(&recorder.created).await);
        assert!(recorder.seen.lock().unwrap().contains(&fresh));

        std::fs::remove_file(&fresh).unwrap();
        assert!(wait_for(&recorder.removed).await);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let recorder = Arc::new(Recorder::default());
        let result = DirectoryWatcher::new(
            PathBuf::from("/nonexistent/modwire/plugins"),
            recorder,
            false,
            DEFAULT_POLL_INTERVAL,
        )
        .await;
        assert!(result.is_err());
    }
}
