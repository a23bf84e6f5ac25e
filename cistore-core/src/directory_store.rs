//! On-disk implementation cache
//!
//! Manages a cache directory whose immediate children are committed
//! implementations, each named by its manifest digest. New content enters
//! through a stage→verify→commit sequence: it is materialized in a
//! randomly named staging directory inside the store root, its manifest
//! digest is checked against the expected value, and only then is it
//! renamed into its final digest-named slot. The rename is the sole
//! atomicity boundary; a concurrent reader sees either nothing or the
//! fully formed entry.

use crate::archive::{ArchiveSource, Extractor};
use crate::digest::ManifestDigest;
use crate::format::ManifestFormat;
use crate::generator::ManifestGenerator;
use crate::manifest::MANIFEST_FILE;
use crate::store::{AuditMismatch, Store, StoreError};
use crate::task::TaskHandler;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Whether a store directory accepts new implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Write access is available; the mtime-resolution check passed.
    ReadWrite,
    /// No write access; usable as a read fallback only.
    ReadOnly,
}

/// A cache directory storing implementations, each in its own
/// digest-named subdirectory.
///
/// The represented store data is mutable but the struct itself never
/// changes after construction.
pub struct DirectoryStore {
    path: PathBuf,
    kind: StoreKind,
    use_write_protection: bool,
    /// Serializes the existence-check + rename commit step for concurrent
    /// adds of the same digest. Kept narrow so staging and hashing of
    /// different digests proceed without coordination.
    rename_lock: Mutex<()>,
}

impl DirectoryStore {
    /// Opens (or creates) a store at `path` with write protection enabled.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_options(path, true)
    }

    /// Opens (or creates) a store, controlling whether committed entries are
    /// made read-only. Fails if the filesystem cannot store modification
    /// times accurate to the second (manifest digests would break); the
    /// check is skipped when the directory is not writable to us.
    pub fn with_options(path: impl Into<PathBuf>, use_write_protection: bool) -> Result<Self, StoreError> {
        let path = path.into();
        fs::create_dir_all(&path).map_err(StoreError::io(&path))?;
        let kind = determine_kind(&path)?;
        Ok(Self { path, kind, use_write_protection, rename_lock: Mutex::new(()) })
    }

    /// The root directory of the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Creates a fresh randomly named staging directory inside the store
    /// root. Same filesystem as the final slot, so the commit rename is
    /// guaranteed to be atomic.
    fn create_staging_dir(&self) -> Result<PathBuf, StoreError> {
        let staging = self.path.join(format!("stage-{}", Uuid::new_v4().simple()));
        fs::create_dir(&staging).map_err(StoreError::io(&staging))?;
        Ok(staging)
    }

    /// Verifies the staged directory against the expected digest and moves
    /// it into its final digest-named slot.
    fn verify_and_add(
        &self,
        staging: &Path,
        expected: &ManifestDigest,
        expected_id: &str,
        format: ManifestFormat,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        let manifest = ManifestGenerator::new(staging, format).run(handler)?;
        // Digest the manifest bytes as written, not the in-memory state
        let actual_id = manifest.save_to_path(&staging.join(MANIFEST_FILE))?;

        if actual_id != expected_id {
            return Err(StoreError::DigestMismatch {
                expected: expected_id.to_string(),
                actual: actual_id,
                manifest: Some(Box::new(manifest)),
            });
        }

        let target = self.path.join(expected_id);
        {
            let _guard = self.rename_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if target.exists() {
                return Err(StoreError::AlreadyInStore(expected.clone()));
            }
            fs::rename(staging, &target).map_err(StoreError::io(&target))?;
        }
        debug!(digest = %expected_id, "committed implementation");

        // Sealing is hardening, not correctness; the content is already valid
        if self.use_write_protection {
            enable_write_protection(&target);
        }
        Ok(target)
    }

    fn stage_and_commit(
        &self,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
        populate: impl FnOnce(&Path) -> Result<(), StoreError>,
    ) -> Result<PathBuf, StoreError> {
        // Argument errors surface before any copying or extraction happens
        let expected_id = digest.best().ok_or(StoreError::NoKnownDigestMethod)?;
        let format =
            ManifestFormat::from_prefix(&expected_id).map_err(|_| StoreError::NoKnownDigestMethod)?;

        let staging = self.create_staging_dir()?;
        debug!(staging = %staging.display(), "staging implementation");
        let result = populate(&staging)
            .and_then(|()| self.verify_and_add(&staging, digest, &expected_id, format, handler));
        // On success the staging directory no longer exists (it was renamed)
        if staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(staging = %staging.display(), %err, "unable to clean up staging directory");
            }
        }
        result
    }
}

impl Store for DirectoryStore {
    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError> {
        let mut result = Vec::new();
        for name in child_directories(&self.path)? {
            if let Ok(digest) = ManifestDigest::from_id(&name) {
                result.push(digest);
            }
        }
        result.sort();
        Ok(result)
    }

    fn list_all_temp(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut result = Vec::new();
        for name in child_directories(&self.path)? {
            // Anything that does not parse as a digest is a staging leftover
            if ManifestDigest::from_id(&name).is_err() {
                result.push(self.path.join(name));
            }
        }
        result.sort();
        Ok(result)
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        digest.available_digests().iter().any(|id| self.path.join(id).is_dir())
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        digest
            .available_digests()
            .iter()
            .map(|id| self.path.join(id))
            .find(|candidate| candidate.is_dir())
    }

    fn add_directory(
        &self,
        path: &Path,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        if self.contains(digest) {
            return Err(StoreError::AlreadyInStore(digest.clone()));
        }
        self.stage_and_commit(digest, handler, |staging| copy_tree(path, staging, handler))
    }

    fn add_archives(
        &self,
        archives: &[ArchiveSource],
        extractor: &dyn Extractor,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        if self.contains(digest) {
            return Err(StoreError::AlreadyInStore(digest.clone()));
        }
        self.stage_and_commit(digest, handler, |staging| {
            // Extract archives "on top of each other" in the caller's order
            for archive in archives {
                if handler.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                extractor
                    .extract(archive, staging, handler)
                    .map_err(StoreError::io(&archive.path))?;
            }
            Ok(())
        })
    }

    fn remove(&self, digest: &ManifestDigest) -> Result<bool, StoreError> {
        let Some(target) = self.get_path(digest) else {
            return Ok(false);
        };

        disable_write_protection(&target);

        // Two-phase removal: the digest-named entry disappears atomically,
        // then the contents are deleted under a throwaway name
        let doomed = self.path.join(format!("remove-{}", Uuid::new_v4().simple()));
        fs::rename(&target, &doomed).map_err(StoreError::io(&target))?;
        fs::remove_dir_all(&doomed).map_err(StoreError::io(&doomed))?;
        debug!(digest = %digest, "removed implementation");
        Ok(true)
    }

    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        let Some(target) = self.get_path(digest) else {
            return Err(StoreError::NotFound(digest.clone()));
        };
        let stored_id = file_name(&target);
        let format =
            ManifestFormat::from_prefix(&stored_id).map_err(|_| StoreError::NoKnownDigestMethod)?;

        let manifest = ManifestGenerator::new(&target, format).run(handler)?;
        let actual_id = manifest.calculate_digest();

        // Reseal in case the write protection got lost
        if self.use_write_protection {
            enable_write_protection(&target);
        }

        if actual_id != stored_id {
            return Err(StoreError::DigestMismatch {
                expected: stored_id,
                actual: actual_id,
                manifest: Some(Box::new(manifest)),
            });
        }
        Ok(())
    }

    fn audit<'a>(&'a self, handler: &'a dyn TaskHandler) -> Box<dyn Iterator<Item = AuditMismatch> + 'a> {
        let digests = match self.list_all() {
            Ok(digests) => digests,
            Err(err) => {
                warn!(store = %self.path.display(), %err, "unable to list store for audit");
                Vec::new()
            }
        };
        Box::new(AuditIter { store: self, digests: digests.into_iter(), handler })
    }

    fn optimise(&self, handler: &dyn TaskHandler) -> Result<u64, StoreError> {
        optimise_store(self, handler)
    }
}

/// Lazily verifies store entries, yielding one mismatch per damaged entry.
struct AuditIter<'a> {
    store: &'a DirectoryStore,
    digests: std::vec::IntoIter<ManifestDigest>,
    handler: &'a dyn TaskHandler,
}

impl Iterator for AuditIter<'_> {
    type Item = AuditMismatch;

    fn next(&mut self) -> Option<AuditMismatch> {
        for digest in self.digests.by_ref() {
            match self.store.verify(&digest, self.handler) {
                Ok(()) => {}
                Err(StoreError::DigestMismatch { expected, actual, .. }) => {
                    return Some(AuditMismatch { expected, actual });
                }
                Err(err) => {
                    warn!(digest = %digest, %err, "audit could not verify entry");
                }
            }
        }
        None
    }
}

impl fmt::Display for DirectoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectoryStore: {}", self.path.display())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
}

fn child_directories(path: &Path) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(StoreError::io(path)(err)),
    };
    for entry in entries {
        let entry = entry.map_err(StoreError::io(path))?;
        let file_type = entry.file_type().map_err(StoreError::io(entry.path()))?;
        if file_type.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn determine_kind(path: &Path) -> Result<StoreKind, StoreError> {
    match probe_time_accuracy(path) {
        Ok(()) => Ok(StoreKind::ReadWrite),
        // No write access; the check cannot be performed, which is fine
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(StoreKind::ReadOnly),
        Err(err) => Err(StoreError::Io { path: path.to_path_buf(), source: err }),
    }
}

/// Ensures the filesystem stores modification times accurate to the second.
/// Legacy manifest formats compare mtimes elsewhere in the ecosystem, so a
/// coarser resolution would silently break digests.
fn probe_time_accuracy(path: &Path) -> io::Result<()> {
    // An odd number of seconds; filesystems with 2s resolution will round it
    let expected = 1_194_857_723u64;
    let probe = path.join(format!(".accuracy-probe-{}", Uuid::new_v4().simple()));

    let result = (|| {
        fs::write(&probe, b"")?;
        File::open(&probe)?.set_modified(UNIX_EPOCH + Duration::from_secs(expected))?;
        let observed = fs::symlink_metadata(&probe)?.modified()?;
        let observed_secs =
            observed.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
        if observed_secs != expected {
            return Err(io::Error::other(
                "filesystem does not store modification times accurate to the second",
            ));
        }
        Ok(())
    })();

    let _ = fs::remove_file(&probe);
    result
}

/// Recursively copies a tree, preserving modification times, permissions and
/// symlinks; all three feed the manifest digest.
fn copy_tree(source: &Path, dest: &Path, handler: &dyn TaskHandler) -> Result<(), StoreError> {
    for entry in fs::read_dir(source).map_err(StoreError::io(source))? {
        if handler.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let entry = entry.map_err(StoreError::io(source))?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        let meta = fs::symlink_metadata(&path).map_err(StoreError::io(&path))?;

        if meta.file_type().is_symlink() {
            copy_symlink(&path, &target).map_err(StoreError::io(&path))?;
        } else if meta.is_dir() {
            fs::create_dir(&target).map_err(StoreError::io(&target))?;
            copy_tree(&path, &target, handler)?;
            // After populating, so child creation does not bump it again
            copy_dir_mtime(&meta, &target).map_err(StoreError::io(&target))?;
        } else {
            fs::copy(&path, &target).map_err(StoreError::io(&path))?;
            copy_mtime(&meta, &target).map_err(StoreError::io(&target))?;
        }
    }
    Ok(())
}

fn copy_mtime(source_meta: &fs::Metadata, target: &Path) -> io::Result<()> {
    File::open(target)?.set_modified(source_meta.modified()?)
}

#[cfg(unix)]
fn copy_dir_mtime(source_meta: &fs::Metadata, target: &Path) -> io::Result<()> {
    copy_mtime(source_meta, target)
}

#[cfg(not(unix))]
fn copy_dir_mtime(_source_meta: &fs::Metadata, _target: &Path) -> io::Result<()> {
    // Directories cannot be opened as plain files on Windows
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(source)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    // Creating symlinks may require elevated rights; fall back to copying
    match std::fs::read_link(source) {
        Ok(_) => {
            fs::copy(source, target)?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Makes a committed entry read-only, recursively. Failures are logged and
/// ignored; losing write protection is a hardening nicety, not a
/// correctness requirement.
pub fn enable_write_protection(path: &Path) {
    if let Err(err) = set_write_protection(path, true) {
        warn!(path = %path.display(), %err, "unable to write-protect implementation");
    }
}

/// Removes write protection recursively, e.g. before removal. Failures are
/// logged; the following operation will surface them if they matter.
pub fn disable_write_protection(path: &Path) {
    if let Err(err) = set_write_protection(path, false) {
        warn!(path = %path.display(), %err, "unable to lift write protection");
    }
}

fn set_write_protection(path: &Path, protect: bool) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            set_write_protection(&entry?.path(), protect)?;
        }
    }

    let mut perms = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        perms.set_mode(if protect { mode & !0o222 } else { mode | 0o200 });
    }
    #[cfg(not(unix))]
    perms.set_readonly(protect);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn optimise_store(store: &DirectoryStore, handler: &dyn TaskHandler) -> Result<u64, StoreError> {
    use crate::manifest::{Manifest, ManifestNode};
    use std::collections::HashMap;
    use std::os::unix::fs::MetadataExt;

    // Identical content with identical manifest metadata can share an inode
    #[derive(PartialEq, Eq, Hash)]
    struct DedupKey {
        prefix: &'static str,
        digest: String,
        modified_time: i64,
        size: u64,
        executable: bool,
    }

    fn relink(original: &Path, duplicate: &Path, size: u64) -> io::Result<u64> {
        let original_meta = fs::metadata(original)?;
        let duplicate_meta = fs::metadata(duplicate)?;
        if original_meta.dev() == duplicate_meta.dev() && original_meta.ino() == duplicate_meta.ino() {
            return Ok(0);
        }

        let parent = duplicate
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file without parent"))?;

        // The parent is write-protected; lift that only for the swap
        let sealed_perms = fs::metadata(parent)?.permissions();
        let mut writable = sealed_perms.clone();
        {
            use std::os::unix::fs::PermissionsExt;
            writable.set_mode(writable.mode() | 0o200);
        }
        fs::set_permissions(parent, writable)?;

        let temp = parent.join(format!(".optimise-{}", Uuid::new_v4().simple()));
        let swap = fs::hard_link(original, &temp).and_then(|()| fs::rename(&temp, duplicate));
        if swap.is_err() {
            let _ = fs::remove_file(&temp);
        }
        fs::set_permissions(parent, sealed_perms)?;
        swap.map(|()| size)
    }

    let mut seen: HashMap<DedupKey, PathBuf> = HashMap::new();
    let mut saved = 0u64;

    for digest in store.list_all()? {
        if handler.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let Some(dir) = store.get_path(&digest) else { continue };
        let Ok(format) = ManifestFormat::from_prefix(&file_name(&dir)) else { continue };
        let Ok(manifest) = Manifest::load_path(&dir.join(MANIFEST_FILE), format) else {
            warn!(digest = %digest, "entry without readable manifest skipped by optimise");
            continue;
        };

        let mut current_dir = dir.clone();
        for node in manifest.nodes() {
            let (entry, executable) = match node {
                ManifestNode::Directory(d) => {
                    current_dir = dir.join(d.full_path.trim_start_matches('/'));
                    continue;
                }
                ManifestNode::NormalFile(f) => (f, false),
                ManifestNode::ExecutableFile(f) => (f, true),
                ManifestNode::Symlink(_) => continue,
            };
            if entry.size == 0 {
                continue;
            }

            let file_path = current_dir.join(&entry.name);
            let key = DedupKey {
                prefix: format.prefix(),
                digest: entry.digest.clone(),
                modified_time: entry.modified_time,
                size: entry.size,
                executable,
            };
            match seen.get(&key) {
                Some(original) => match relink(original, &file_path, entry.size) {
                    Ok(bytes) => saved += bytes,
                    Err(err) => {
                        warn!(path = %file_path.display(), %err, "unable to deduplicate file")
                    }
                },
                None => {
                    seen.insert(key, file_path);
                }
            }
        }
    }
    Ok(saved)
}

#[cfg(not(unix))]
fn optimise_store(_store: &DirectoryStore, _handler: &dyn TaskHandler) -> Result<u64, StoreError> {
    // Hard-link deduplication relies on inode identity checks
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_store_is_read_write_and_empty() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path().join("store")).unwrap();
        assert_eq!(store.kind(), StoreKind::ReadWrite);
        assert!(store.list_all().unwrap().is_empty());
        assert!(store.list_all_temp().unwrap().is_empty());
    }

    #[test]
    fn non_digest_directories_are_listed_as_temp() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        fs::create_dir(dir.path().join("stage-abc123")).unwrap();

        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(store.list_all_temp().unwrap(), vec![dir.path().join("stage-abc123")]);
    }

    #[test]
    fn contains_and_get_path_check_all_algorithms() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        fs::create_dir(dir.path().join("sha1new=abc")).unwrap();

        let mut digest = ManifestDigest::new();
        digest.parse_id("sha256new_MISSING");
        digest.parse_id("sha1new=abc");
        assert!(store.contains(&digest));
        assert_eq!(store.get_path(&digest), Some(dir.path().join("sha1new=abc")));
    }

    #[test]
    fn remove_missing_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let digest = ManifestDigest::from_id("sha256new_GONE").unwrap();
        assert!(!store.remove(&digest).unwrap());
    }
}
