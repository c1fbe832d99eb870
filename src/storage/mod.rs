// Package storage provides the key/value storage capability consumed by
// collaborating apps (certificate automation being the primary customer)
// and its default filesystem implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, warn};


/// Metadata for one stored key.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub modified: Option<SystemTime>,
    pub size: u64,
    /// False when the key names a prefix with children rather than a
    /// value of its own.
    pub is_terminal: bool,
}

/// A hierarchical key/value store. Keys are slash-separated paths.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Vec<u8>>;

    /// Stores a value. The write must be atomic: a concurrent `load`
    /// sees either the previous value or the new one, never a torn one.
    async fn store(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> bool;

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>>;

    async fn stat(&self, key: &str) -> Result<KeyInfo>;

    /// Acquires the named cross-process lock, waiting for a holder to
    /// release or go stale.
    async fn lock(&self, name: &str) -> Result<()>;

    async fn unlock(&self, name: &str) -> Result<()>;
}

/// How long a lock file may sit untouched before being considered
/// abandoned by a dead process.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(120);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Filesystem-backed [`Storage`] rooted at a directory.
pub struct FileStorage {
    root: PathBuf,
    /// Locks held by this instance, so unlock only removes our own.
    held: Mutex<HashMap<String, PathBuf>>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// The default store location under the OS data directory.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("trellis")
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let clean: PathBuf = key
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .collect();
        self.root.join(clean)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join("locks").join(format!("{name}.lock"))
    }

    fn path_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// Synchronous directory walk; callers run it on the blocking pool.
    fn walk(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    Self::walk(&path, recursive, out)?;
                } else {
                    out.push(path);
                }
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(key);
        fs::read(&path)
            .await
            .with_context(|| format!("loading key {key:?}"))
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating parent of key {key:?}"))?;
        }

        // Write-temp-then-rename keeps readers from observing a torn value.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)
            .await
            .with_context(|| format!("writing key {key:?}"))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("committing key {key:?}"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("deleting key {key:?}"))
    }

    async fn exists(&self, key: &str) -> bool {
        fs::metadata(self.key_path(key)).await.is_ok()
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let dir = self.key_path(prefix);
        let is_dir = tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Ok(Vec::new());
        }

        // The directory walk is synchronous I/O; keep it off the
        // runtime threads.
        let walk_root = dir.clone();
        let paths = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<PathBuf>> {
            let mut out = Vec::new();
            Self::walk(&walk_root, recursive, &mut out)?;
            Ok(out)
        })
        .await
        .context("list walker panicked")?
        .with_context(|| format!("listing prefix {prefix:?}"))?;

        let mut keys: Vec<String> = paths.iter().filter_map(|p| self.path_key(p)).collect();
        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> Result<KeyInfo> {
        let path = self.key_path(key);
        let meta = fs::metadata(&path)
            .await
            .with_context(|| format!("stat of key {key:?}"))?;
        Ok(KeyInfo {
            modified: meta.modified().ok(),
            size: meta.len(),
            is_terminal: meta.is_file(),
        })
    }

    async fn lock(&self, name: &str) -> Result<()> {
        let path = self.lock_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.ok();
        }

        loop {
            // The create-new attempt and the staleness probe are
            // synchronous filesystem calls; run them on the blocking
            // pool so a contended lock never stalls runtime threads.
            let attempt_path = path.clone();
            let acquired = tokio::task::spawn_blocking(move || try_create_lock(&attempt_path))
                .await
                .context("lock attempt panicked")?
                .with_context(|| format!("acquiring lock {name:?}"))?;

            if acquired {
                self.held.lock().insert(name.to_string(), path.clone());
                debug!(
                    component = "storage",
                    event = "lock_acquired",
                    name = name,
                    "lock file created"
                );
                return Ok(());
            }

            // A holder that stopped refreshing is treated as dead.
            let probe_path = path.clone();
            let stale = tokio::task::spawn_blocking(move || lock_is_stale(&probe_path))
                .await
                .context("lock staleness probe panicked")?;
            if stale {
                warn!(
                    component = "storage",
                    event = "stale_lock_removed",
                    name = name,
                    "removing abandoned lock file"
                );
                let _ = fs::remove_file(&path).await;
                continue;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        let path = self
            .held
            .lock()
            .remove(name)
            .with_context(|| format!("unlock of lock {name:?} not held by this instance"))?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("releasing lock {name:?}"))
    }
}

/// Creates the lock file unless a holder exists. Runs on the blocking
/// pool.
fn try_create_lock(path: &Path) -> std::io::Result<bool> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut f) => {
            use std::io::Write as _;
            let _ = write!(f, "{}", std::process::id());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether a held lock file has sat untouched past the staleness
/// horizon. Runs on the blocking pool.
fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| t.elapsed().unwrap_or_default() > LOCK_STALE_AFTER)
        .unwrap_or(true)
}
