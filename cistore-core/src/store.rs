//! Store abstraction
//!
//! The `Store` trait is the public contract of every implementation cache:
//! a single on-disk directory (`DirectoryStore`), an aggregate
//! (`CompositeStore`), or an out-of-process adapter provided elsewhere.

use crate::archive::{ArchiveSource, Extractor};
use crate::digest::ManifestDigest;
use crate::manifest::{Manifest, ManifestError};
use crate::task::TaskHandler;
use std::io;
use std::path::{Path, PathBuf};

/// Errors raised by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("implementation {0} not found in store")]
    NotFound(ManifestDigest),

    #[error("implementation {0} is already in the store")]
    AlreadyInStore(ManifestDigest),

    #[error("digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch {
        expected: String,
        actual: String,
        /// The generated manifest, for diagnostics.
        manifest: Option<Box<Manifest>>,
    },

    #[error("the digest carries no known digest method")]
    NoKnownDigestMethod,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Manifest(ManifestError),

    #[error("problem accessing store at '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("access to '{path}' denied")]
    AccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not add implementation to any store")]
    AddFailed {
        #[source]
        last_error: Option<Box<StoreError>>,
    },
}

impl From<ManifestError> for StoreError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Cancelled => StoreError::Cancelled,
            other => StoreError::Manifest(other),
        }
    }
}

impl StoreError {
    /// Wraps an IO error with the offending path, reclassifying permission
    /// problems so callers can tell them apart from corruption.
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.into();
        move |source| {
            if source.kind() == io::ErrorKind::PermissionDenied {
                StoreError::AccessDenied { path, source }
            } else {
                StoreError::Io { path, source }
            }
        }
    }

    /// Whether retrying against another store could possibly succeed.
    /// Digest mismatches, duplicates and cancellation are final.
    pub(crate) fn is_fatal_for_routing(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyInStore(_)
                | StoreError::DigestMismatch { .. }
                | StoreError::NoKnownDigestMethod
                | StoreError::Cancelled
        )
    }
}

/// One entry produced by a store audit: a committed implementation whose
/// recomputed digest no longer matches its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditMismatch {
    pub expected: String,
    pub actual: String,
}

/// A cache for implementations, each identified by a `ManifestDigest`.
pub trait Store: Sync {
    /// All committed implementations in the store.
    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError>;

    /// Leftover staging directories from crashed or interrupted additions.
    /// Surfaced for cleanup tooling, never deleted implicitly.
    fn list_all_temp(&self) -> Result<Vec<PathBuf>, StoreError>;

    /// Whether the store contains an implementation matching the digest.
    fn contains(&self, digest: &ManifestDigest) -> bool;

    /// Drops any cached containment state.
    fn flush(&self) {}

    /// The path of the committed implementation, if present.
    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf>;

    /// Copies a directory tree into the store after verifying it against the
    /// expected digest. Returns the final path of the committed entry.
    fn add_directory(
        &self,
        path: &Path,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError>;

    /// Extracts one or more archives on top of each other in the given order,
    /// then verifies and commits the result.
    fn add_archives(
        &self,
        archives: &[ArchiveSource],
        extractor: &dyn Extractor,
        digest: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError>;

    /// Removes an implementation. Returns `false` if it was not present.
    fn remove(&self, digest: &ManifestDigest) -> Result<bool, StoreError>;

    /// Recomputes the manifest of a committed implementation and checks it
    /// against the digest it is stored under.
    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<(), StoreError>;

    /// Lazily verifies every entry, yielding one mismatch per damaged
    /// implementation. Callers may stop consuming to bound the work.
    fn audit<'a>(&'a self, handler: &'a dyn TaskHandler) -> Box<dyn Iterator<Item = AuditMismatch> + 'a>;

    /// Storage optimisations such as deduplicating identical files.
    /// Returns the number of bytes saved.
    fn optimise(&self, handler: &dyn TaskHandler) -> Result<u64, StoreError>;
}
