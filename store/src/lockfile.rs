//! Pinned hashes of fetched content.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::Error;

/// Maps a fetch key (usually a URL) to the output hash its content had the
/// first time it was fetched.
pub trait Lockfile: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;

    /// Records the hash for `key`. Recording a different hash for a key that
    /// already has one is an error.
    fn record(&self, key: &str, hash: &str) -> Result<(), Error>;
}

/// A [Lockfile] held in memory, which can be loaded from and saved to a JSON
/// file.
#[derive(Debug, Default)]
pub struct MemoryLockfile {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryLockfile {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read(path) {
            Ok(data) => Ok(Self::new(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(&*self.entries.read())?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

impl Lockfile for MemoryLockfile {
    fn lookup(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn record(&self, key: &str, hash: &str) -> Result<(), Error> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) if existing != hash => Err(Error::LockfileConflict {
                key: key.to_string(),
                existing: existing.clone(),
                new: hash.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                debug!(key, hash, "recording lockfile entry");
                entries.insert(key.to_string(), hash.to_string());
                Ok(())
            }
        }
    }
}

/// A [MemoryLockfile] that writes itself back to disk after every new entry.
#[derive(Debug)]
pub struct FileLockfile {
    path: PathBuf,
    inner: MemoryLockfile,
}

impl FileLockfile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let inner = MemoryLockfile::load(&path)?;
        Ok(Self { path, inner })
    }
}

impl Lockfile for FileLockfile {
    fn lookup(&self, key: &str) -> Option<String> {
        self.inner.lookup(key)
    }

    fn record(&self, key: &str, hash: &str) -> Result<(), Error> {
        if self.inner.lookup(key).as_deref() == Some(hash) {
            return Ok(());
        }
        self.inner.record(key, hash)?;
        self.inner.save(&self.path)
    }
}
