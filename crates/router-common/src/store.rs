//! Namespaced key-value Persistent Store.
//!
//! The store mirrors the semantics of an embedded NVS partition: a caller
//! opens a namespace read-only or read-write, performs typed reads and
//! writes through the returned handle, commits, and closes the handle by
//! dropping it. Writes are staged in the handle and become durable (and
//! visible to other handles) only when [`StoreHandle::commit`] succeeds.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: process-local, used by tests and fixtures
//! - [`FileStore`]: a JSON image on disk, replaced atomically on commit

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};

/// Access mode requested when opening a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A typed value held in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreValue {
    Str(String),
    Blob(Vec<u8>),
}

/// Image of every namespace: namespace -> key -> value.
pub type StoreImage = BTreeMap<String, BTreeMap<String, StoreValue>>;

/// An open namespace. Dropping the handle closes it; uncommitted writes
/// are discarded.
pub trait StoreHandle: Send {
    /// Reads a string value. `Ok(None)` when the key is absent.
    fn get_str(&self, key: &str) -> RouterResult<Option<String>>;

    /// Reads a blob value. `Ok(None)` when the key is absent.
    fn get_blob(&self, key: &str) -> RouterResult<Option<Vec<u8>>>;

    /// Stages a string write.
    fn set_str(&mut self, key: &str, value: &str) -> RouterResult<()>;

    /// Stages a blob write.
    fn set_blob(&mut self, key: &str, value: &[u8]) -> RouterResult<()>;

    /// Stages removal of a key. Removing an absent key is not an error.
    fn erase_key(&mut self, key: &str) -> RouterResult<()>;

    /// Makes every staged change durable as one unit.
    fn commit(&mut self) -> RouterResult<()>;
}

/// A namespaced key-value store that survives restarts.
pub trait PersistentStore: Send + Sync {
    /// Opens `namespace`. Fails with [`RouterError::StoreUnavailable`]
    /// when the backing medium cannot be used.
    fn open(&self, namespace: &str, mode: OpenMode) -> RouterResult<Box<dyn StoreHandle + '_>>;
}

/// Backing image a [`StagedHandle`] reads from and commits into.
trait CommitTarget: Send + Sync {
    fn read(&self, namespace: &str, key: &str) -> Option<StoreValue>;

    fn apply(&self, namespace: &str, changes: &BTreeMap<String, Option<StoreValue>>)
        -> RouterResult<()>;
}

/// Handle shared by both store implementations.
struct StagedHandle<'a> {
    target: &'a dyn CommitTarget,
    namespace: String,
    mode: OpenMode,
    staged: BTreeMap<String, Option<StoreValue>>,
}

impl<'a> StagedHandle<'a> {
    fn new(target: &'a dyn CommitTarget, namespace: &str, mode: OpenMode) -> Self {
        Self {
            target,
            namespace: namespace.to_string(),
            mode,
            staged: BTreeMap::new(),
        }
    }

    fn lookup(&self, key: &str) -> Option<StoreValue> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.target.read(&self.namespace, key),
        }
    }

    fn ensure_writable(&self, operation: &str, key: &str) -> RouterResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(RouterError::store(
                operation,
                key,
                format!("namespace '{}' opened read-only", self.namespace),
            ));
        }
        Ok(())
    }
}

impl StoreHandle for StagedHandle<'_> {
    fn get_str(&self, key: &str) -> RouterResult<Option<String>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(StoreValue::Str(s)) => Ok(Some(s)),
            Some(StoreValue::Blob(_)) => Err(RouterError::store(
                "get_str",
                key,
                "value is a blob, not a string",
            )),
        }
    }

    fn get_blob(&self, key: &str) -> RouterResult<Option<Vec<u8>>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(StoreValue::Blob(b)) => Ok(Some(b)),
            Some(StoreValue::Str(_)) => Err(RouterError::store(
                "get_blob",
                key,
                "value is a string, not a blob",
            )),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> RouterResult<()> {
        self.ensure_writable("set_str", key)?;
        self.staged
            .insert(key.to_string(), Some(StoreValue::Str(value.to_string())));
        Ok(())
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> RouterResult<()> {
        self.ensure_writable("set_blob", key)?;
        self.staged
            .insert(key.to_string(), Some(StoreValue::Blob(value.to_vec())));
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> RouterResult<()> {
        self.ensure_writable("erase_key", key)?;
        self.staged.insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&mut self) -> RouterResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.ensure_writable("commit", "*")?;
        self.target.apply(&self.namespace, &self.staged)?;
        self.staged.clear();
        Ok(())
    }
}

fn apply_changes(
    image: &mut StoreImage,
    namespace: &str,
    changes: &BTreeMap<String, Option<StoreValue>>,
) {
    let ns = image.entry(namespace.to_string()).or_default();
    for (key, change) in changes {
        match change {
            Some(value) => {
                ns.insert(key.clone(), value.clone());
            }
            None => {
                ns.remove(key);
            }
        }
    }
}

/// In-memory store.
///
/// Thread-safe; can be made unavailable or made to fail commits so callers'
/// degradation paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    image: Mutex<StoreImage>,
    unavailable: AtomicBool,
    fail_commits: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with string parameters in `namespace`.
    pub fn with_strings<'a, I>(namespace: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let store = Self::new();
        {
            let mut image = store.image.lock();
            let ns = image.entry(namespace.to_string()).or_default();
            for (k, v) in entries {
                ns.insert(k.to_string(), StoreValue::Str(v.to_string()));
            }
        }
        store
    }

    /// Writes a value directly, bypassing handles (out-of-band provisioning).
    pub fn insert(&self, namespace: &str, key: &str, value: StoreValue) {
        self.image
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Reads a committed value directly.
    pub fn value(&self, namespace: &str, key: &str) -> Option<StoreValue> {
        self.image.lock().get(namespace)?.get(key).cloned()
    }

    /// Makes every subsequent `open` fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every subsequent commit fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl CommitTarget for MemoryStore {
    fn read(&self, namespace: &str, key: &str) -> Option<StoreValue> {
        self.value(namespace, key)
    }

    fn apply(
        &self,
        namespace: &str,
        changes: &BTreeMap<String, Option<StoreValue>>,
    ) -> RouterResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(RouterError::store("commit", namespace, "commit failed"));
        }
        apply_changes(&mut self.image.lock(), namespace, changes);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn open(&self, namespace: &str, mode: OpenMode) -> RouterResult<Box<dyn StoreHandle + '_>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RouterError::store_unavailable(
                namespace,
                "store not initialized",
            ));
        }
        Ok(Box::new(StagedHandle::new(self, namespace, mode)))
    }
}

/// File-backed store.
///
/// The whole store is one JSON document. A commit writes the new image to
/// a sibling temporary file, syncs it and renames it over the original,
/// so a power loss leaves either the previous or the new image.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    image: Mutex<Option<StoreImage>>,
}

impl FileStore {
    /// Creates a store backed by `path`. The file is read on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            image: Mutex::new(None),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self, namespace: &str) -> RouterResult<()> {
        let mut image = self.image.lock();
        if image.is_some() {
            return Ok(());
        }

        let loaded = match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str::<StoreImage>(&content).map_err(|e| {
                RouterError::store_unavailable(
                    namespace,
                    format!("failed to parse {}: {}", self.path.display(), e),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Store file not found, starting empty");
                StoreImage::new()
            }
            Err(e) => {
                return Err(RouterError::store_unavailable(
                    namespace,
                    format!("failed to read {}: {}", self.path.display(), e),
                ))
            }
        };

        *image = Some(loaded);
        Ok(())
    }

    fn write_image(&self, image: &StoreImage) -> RouterResult<()> {
        let content = serde_json::to_vec_pretty(image)
            .map_err(|e| RouterError::store("commit", self.path.display().to_string(), e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        let io_err = |e: std::io::Error| {
            RouterError::store("commit", self.path.display().to_string(), e.to_string())
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to replace store file");
            io_err(e)
        })
    }
}

impl CommitTarget for FileStore {
    fn read(&self, namespace: &str, key: &str) -> Option<StoreValue> {
        self.image
            .lock()
            .as_ref()?
            .get(namespace)?
            .get(key)
            .cloned()
    }

    fn apply(
        &self,
        namespace: &str,
        changes: &BTreeMap<String, Option<StoreValue>>,
    ) -> RouterResult<()> {
        let mut guard = self.image.lock();
        let mut next = guard.clone().unwrap_or_default();
        apply_changes(&mut next, namespace, changes);
        self.write_image(&next)?;
        *guard = Some(next);
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn open(&self, namespace: &str, mode: OpenMode) -> RouterResult<Box<dyn StoreHandle + '_>> {
        self.load(namespace)?;
        Ok(Box::new(StagedHandle::new(self, namespace, mode)))
    }
}
