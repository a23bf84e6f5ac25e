//! Aggregation of multiple stores
//!
//! A `CompositeStore` combines several child stores behind the single
//! `Store` interface. Reads are answered by the first child that can;
//! writes are attempted from the last child toward the first, so
//! caller-local stores at the back take new content before system-wide
//! ones at the front.

use crate::archive::{ArchiveSource, Extractor};
use crate::digest::ManifestDigest;
use crate::store::{AuditMismatch, Store, StoreError};
use crate::task::TaskHandler;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const CONTAINS_CACHE_SIZE: usize = 256;

/// Combines multiple child stores into one.
///
/// Containment answers are memoized in an LRU cache, so repeated lookups
/// of the same digest do not hit the filesystem of every child. The cache
/// is dropped before any mutation since an external process may have
/// changed the stores in the meantime.
pub struct CompositeStore {
    stores: Vec<Box<dyn Store>>,
    contains_cache: Mutex<LruCache<ManifestDigest, bool>>,
}

impl CompositeStore {
    pub fn new(stores: Vec<Box<dyn Store>>) -> Self {
        let capacity = NonZeroUsize::new(CONTAINS_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self { stores, contains_cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// The child stores, in read priority order.
    pub fn stores(&self) -> &[Box<dyn Store>] {
        &self.stores
    }

    fn attempt_write(
        &self,
        digest: &ManifestDigest,
        write: impl Fn(&dyn Store) -> Result<PathBuf, StoreError>,
    ) -> Result<PathBuf, StoreError> {
        // External processes may have added the digest since the last lookup
        self.flush();
        if self.contains(digest) {
            return Err(StoreError::AlreadyInStore(digest.clone()));
        }

        let mut last_error = None;
        for store in self.stores.iter().rev() {
            match write(store.as_ref()) {
                Ok(path) => {
                    // The pre-check above cached a negative answer; replace it
                    self.contains_cache
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .put(digest.clone(), true);
                    return Ok(path);
                }
                Err(err) if err.is_fatal_for_routing() => return Err(err),
                Err(err) => {
                    warn!(digest = %digest, %err, "store rejected implementation, trying next");
                    last_error = Some(Box::new(err));
                }
            }
        }
        Err(StoreError::AddFailed { last_error })
    }
}

impl Store for CompositeStore {
    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError> {
        let mut result = Vec::new();
        for store in &self.stores {
            match store.list_all() {
                Ok(digests) => result.extend(digests),
                Err(err) => warn!(%err, "skipping unlistable store"),
            }
        }
        result.sort();
        result.dedup();
        Ok(result)
    }

    fn list_all_temp(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut result = Vec::new();
        for store in &self.stores {
            match store.list_all_temp() {
                Ok(paths) => result.extend(paths),
                Err(err) => warn!(%err, "skipping unlistable store"),
            }
        }
        result.sort();
        Ok(result)
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        let mut cache = self.contains_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(&cached) = cache.get(digest) {
            return cached;
        }
        let contained = self.stores.iter().any(|store| store.contains(digest));
        cache.put(digest.clone(), contained);
        contained
    }

    fn flush(&self) {
        self.contains_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        for store in &self.stores {
            store.flush();
        }
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        self.stores.iter().find_map(|store| store.get_path(digest))
    }

    fn add_directory(
        &self,
        path: &Path,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        self.attempt_write(digest, |store| store.add_directory(path, digest, handler))
    }

    fn add_archives(
        &self,
        archives: &[ArchiveSource],
        extractor: &dyn Extractor,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        self.attempt_write(digest, |store| store.add_archives(archives, extractor, digest, handler))
    }

    fn remove(&self, digest: &ManifestDigest) -> Result<bool, StoreError> {
        self.flush();
        let mut removed = false;
        for store in self.stores.iter().rev() {
            removed |= store.remove(digest)?;
        }
        if !removed {
            return Err(StoreError::NotFound(digest.clone()));
        }
        Ok(true)
    }

    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        let mut found = false;
        for store in &self.stores {
            if store.contains(digest) {
                found = true;
                store.verify(digest, handler)?;
            }
        }
        if !found {
            return Err(StoreError::NotFound(digest.clone()));
        }
        Ok(())
    }

    fn audit<'a>(&'a self, handler: &'a dyn TaskHandler) -> Box<dyn Iterator<Item = AuditMismatch> + 'a> {
        Box::new(self.stores.iter().flat_map(move |store| store.audit(handler)))
    }

    fn optimise(&self, handler: &dyn TaskHandler) -> Result<u64, StoreError> {
        let mut saved = 0;
        for store in &self.stores {
            saved += store.optimise(handler)?;
        }
        Ok(saved)
    }
}

impl fmt::Display for CompositeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompositeStore ({} children)", self.stores.len())
    }
}
