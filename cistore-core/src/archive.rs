//! Archive extraction contract
//!
//! The store never extracts archives itself; it consumes an `Extractor`
//! collaborator that materializes a directory tree from an archive byte
//! stream. The contract is deliberately narrow so transport-specific
//! extractors (zip, tar, self-extracting stubs) stay outside the core.

use crate::task::TaskHandler;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Describes one archive to be extracted into a staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSource {
    /// Local path of the archive file.
    pub path: PathBuf,

    /// MIME type selecting the extraction mechanism.
    pub mime_type: String,

    /// Number of leading bytes to skip, e.g. a self-extracting stub.
    #[serde(default)]
    pub start_offset: u64,

    /// Only extract entries below this subdirectory of the archive, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_dir: Option<String>,

    /// Relative destination below the staging directory, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl ArchiveSource {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            start_offset: 0,
            sub_dir: None,
            destination: None,
        }
    }
}

/// Produces a directory tree from an archive byte stream.
///
/// Implementations must honor `start_offset`, `sub_dir` and `destination`
/// and report progress/cancellation through the handler.
pub trait Extractor: Sync {
    fn extract(
        &self,
        source: &ArchiveSource,
        target_dir: &Path,
        handler: &dyn TaskHandler,
    ) -> io::Result<()>;
}
