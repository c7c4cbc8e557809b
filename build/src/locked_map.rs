//! Derivations shared between concurrent builds, each behind its own lock.
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use bramble_store::Derivation;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::Error;

#[derive(Default)]
struct Inner {
    derivations: HashMap<String, Derivation>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Maps derivation hashes to derivations. Reading and patching a derivation
/// goes through [LockedDerivationMap::lock], which serializes access per
/// hash while leaving other hashes free.
///
/// The map lock is only held to look up or create the lock of a hash, never
/// while waiting for one.
#[derive(Default)]
pub struct LockedDerivationMap {
    inner: Mutex<Inner>,
}

impl LockedDerivationMap {
    pub fn new(derivations: HashMap<String, Derivation>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                derivations,
                locks: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, hash: impl Into<String>, drv: Derivation) {
        self.inner.lock().derivations.insert(hash.into(), drv);
    }

    /// Current value for `hash`, without waiting for its lock.
    pub fn get(&self, hash: &str) -> Option<Derivation> {
        self.inner.lock().derivations.get(hash).cloned()
    }

    pub fn name(&self, hash: &str) -> Option<String> {
        self.inner.lock().derivations.get(hash).map(|d| d.name.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, Derivation> {
        self.inner.lock().derivations.clone()
    }

    /// Waits for exclusive access to the derivation with `hash`. The value
    /// is read after the lock is taken, so it includes every earlier patch.
    pub async fn lock(self: &Arc<Self>, hash: &str) -> Result<DerivationGuard, Error> {
        let lock = self
            .inner
            .lock()
            .locks
            .entry(hash.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        let derivation = self
            .get(hash)
            .ok_or_else(|| Error::DerivationNotFound {
                hash: hash.to_string(),
                referenced_by: None,
            })?;
        Ok(DerivationGuard {
            map: self.clone(),
            hash: hash.to_string(),
            derivation,
            _guard: guard,
        })
    }
}

/// Exclusive access to one derivation of a [LockedDerivationMap], released
/// on drop.
pub struct DerivationGuard {
    map: Arc<LockedDerivationMap>,
    hash: String,
    derivation: Derivation,
    _guard: OwnedMutexGuard<()>,
}

impl DerivationGuard {
    /// Replaces the derivation in the map.
    pub fn update(&mut self, drv: Derivation) {
        self.map.insert(self.hash.clone(), drv.clone());
        self.derivation = drv;
    }
}

impl Deref for DerivationGuard {
    type Target = Derivation;

    fn deref(&self) -> &Derivation {
        &self.derivation
    }
}
