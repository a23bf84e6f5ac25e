//! Recipe application
//!
//! A recipe describes how to assemble an implementation from several
//! downloaded files: archives extracted on top of each other plus single
//! files, followed by removals and renames. The steps are applied in order
//! against a temporary working tree; the finished tree is then handed to
//! `Store::add_directory` by the caller.

use crate::archive::{ArchiveSource, Extractor};
use crate::task::TaskHandler;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Errors raised while applying a recipe
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("recipe needs {expected} downloaded files but {actual} were provided")]
    DownloadCountMismatch { expected: usize, actual: usize },

    #[error("recipe path '{0}' is not a safe relative path")]
    InvalidPath(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("problem applying recipe at '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RecipeError {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> RecipeError {
        let path = path.into();
        move |source| RecipeError::Io { path, source }
    }
}

/// One step of a recipe. `Archive` and `SingleFile` each consume one
/// downloaded file, in step order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RecipeStep {
    /// Extract a downloaded archive into the working tree.
    Archive {
        mime_type: String,
        #[serde(default)]
        start_offset: u64,
        /// Only extract entries below this subdirectory of the archive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<String>,
        /// Destination below the working tree root.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },

    /// Place a downloaded file at a path inside the working tree.
    SingleFile {
        destination: String,
        #[serde(default)]
        executable: bool,
    },

    /// Delete a file or directory from the working tree.
    Remove { path: String },

    /// Move a file or directory within the working tree.
    Rename { source: String, destination: String },
}

/// An ordered list of steps assembling one implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    pub fn new(steps: Vec<RecipeStep>) -> Self {
        Self { steps }
    }

    /// Number of downloaded files the recipe consumes.
    pub fn required_downloads(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, RecipeStep::Archive { .. } | RecipeStep::SingleFile { .. }))
            .count()
    }
}

/// A working directory that is deleted again when dropped, unless the
/// caller takes ownership of the path with `into_path`.
#[derive(Debug)]
pub struct TempTree {
    path: Option<PathBuf>,
}

impl TempTree {
    pub fn new() -> io::Result<Self> {
        let path = env::temp_dir().join(format!("cistore-recipe-{}", Uuid::new_v4().simple()));
        fs::create_dir(&path)?;
        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> &Path {
        // Only None after into_path, which consumes self
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    /// Releases the directory to the caller; it will no longer be deleted
    /// on drop.
    pub fn into_path(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for TempTree {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = fs::remove_dir_all(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "unable to delete recipe working tree");
                }
            }
        }
    }
}

/// Applies all steps of a recipe, consuming `downloads` in step order.
///
/// Returns the working tree holding the assembled implementation. The
/// number of downloaded files must match the recipe exactly.
pub fn apply_recipe(
    recipe: &Recipe,
    downloads: &[PathBuf],
    extractor: &dyn Extractor,
    handler: &dyn TaskHandler,
) -> Result<TempTree, RecipeError> {
    let expected = recipe.required_downloads();
    if downloads.len() != expected {
        return Err(RecipeError::DownloadCountMismatch { expected, actual: downloads.len() });
    }

    let tree = TempTree::new().map_err(RecipeError::io(env::temp_dir()))?;
    let mut downloads = downloads.iter();

    for step in &recipe.steps {
        if handler.is_cancelled() {
            return Err(RecipeError::Cancelled);
        }
        match step {
            RecipeStep::Archive { mime_type, start_offset, extract, destination } => {
                // Counted above, so the iterator cannot run dry
                let Some(download) = downloads.next() else { break };
                if let Some(destination) = destination {
                    safe_relative_path(destination)?;
                }
                let source = ArchiveSource {
                    path: download.clone(),
                    mime_type: mime_type.clone(),
                    start_offset: *start_offset,
                    sub_dir: extract.clone(),
                    destination: destination.clone(),
                };
                extractor
                    .extract(&source, tree.path(), handler)
                    .map_err(RecipeError::io(download))?;
            }
            RecipeStep::SingleFile { destination, executable } => {
                let Some(download) = downloads.next() else { break };
                let target = tree.path().join(safe_relative_path(destination)?);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(RecipeError::io(parent))?;
                }
                fs::copy(download, &target).map_err(RecipeError::io(download))?;
                let modified = fs::metadata(download)
                    .and_then(|meta| meta.modified())
                    .map_err(RecipeError::io(download))?;
                File::open(&target)
                    .and_then(|file| file.set_modified(modified))
                    .map_err(RecipeError::io(&target))?;
                if *executable {
                    make_executable(&target).map_err(RecipeError::io(&target))?;
                }
            }
            RecipeStep::Remove { path } => {
                let target = tree.path().join(safe_relative_path(path)?);
                let meta = fs::symlink_metadata(&target).map_err(RecipeError::io(&target))?;
                if meta.is_dir() {
                    fs::remove_dir_all(&target).map_err(RecipeError::io(&target))?;
                } else {
                    fs::remove_file(&target).map_err(RecipeError::io(&target))?;
                }
            }
            RecipeStep::Rename { source, destination } => {
                let from = tree.path().join(safe_relative_path(source)?);
                let to = tree.path().join(safe_relative_path(destination)?);
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).map_err(RecipeError::io(parent))?;
                }
                fs::rename(&from, &to).map_err(RecipeError::io(&from))?;
            }
        }
    }
    Ok(tree)
}

/// Parses a `/`-separated recipe path, rejecting anything that could
/// escape the working tree.
fn safe_relative_path(path: &str) -> Result<PathBuf, RecipeError> {
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return Err(RecipeError::InvalidPath(path.to_string()));
    }
    let mut result = PathBuf::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(RecipeError::InvalidPath(path.to_string())),
            normal => result.push(normal),
        }
    }
    if result.as_os_str().is_empty() {
        return Err(RecipeError::InvalidPath(path.to_string()));
    }
    Ok(result)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SilentTaskHandler;
    use tempfile::TempDir;

    /// Extractor fake that just drops a marker file per extraction.
    struct TouchExtractor;

    impl Extractor for TouchExtractor {
        fn extract(
            &self,
            source: &ArchiveSource,
            target_dir: &Path,
            _handler: &dyn TaskHandler,
        ) -> io::Result<()> {
            let dir = match &source.destination {
                Some(destination) => target_dir.join(destination),
                None => target_dir.to_path_buf(),
            };
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("extracted"), source.mime_type.as_bytes())
        }
    }

    #[test]
    fn single_file_then_rename() {
        let downloads_dir = TempDir::new().unwrap();
        let download = downloads_dir.path().join("payload");
        fs::write(&download, b"hello").unwrap();

        let recipe = Recipe::new(vec![
            RecipeStep::SingleFile { destination: "bin/tool".into(), executable: false },
            RecipeStep::Rename { source: "bin/tool".into(), destination: "tool".into() },
        ]);
        let tree =
            apply_recipe(&recipe, &[download], &TouchExtractor, &SilentTaskHandler).unwrap();
        assert!(!tree.path().join("bin/tool").exists());
        assert_eq!(fs::read(tree.path().join("tool")).unwrap(), b"hello");
    }

    #[test]
    fn archive_step_uses_destination() {
        let downloads_dir = TempDir::new().unwrap();
        let download = downloads_dir.path().join("archive.zip");
        fs::write(&download, b"").unwrap();

        let recipe = Recipe::new(vec![RecipeStep::Archive {
            mime_type: "application/zip".into(),
            start_offset: 0,
            extract: None,
            destination: Some("sub".into()),
        }]);
        let tree =
            apply_recipe(&recipe, &[download], &TouchExtractor, &SilentTaskHandler).unwrap();
        assert!(tree.path().join("sub/extracted").is_file());
    }

    #[test]
    fn remove_step_deletes_directories() {
        let downloads_dir = TempDir::new().unwrap();
        let download = downloads_dir.path().join("payload");
        fs::write(&download, b"x").unwrap();

        let recipe = Recipe::new(vec![
            RecipeStep::SingleFile { destination: "doomed/file".into(), executable: false },
            RecipeStep::Remove { path: "doomed".into() },
        ]);
        let tree =
            apply_recipe(&recipe, &[download], &TouchExtractor, &SilentTaskHandler).unwrap();
        assert!(!tree.path().join("doomed").exists());
    }

    #[test]
    fn download_count_must_match() {
        let recipe = Recipe::new(vec![RecipeStep::SingleFile {
            destination: "file".into(),
            executable: false,
        }]);
        let err = apply_recipe(&recipe, &[], &TouchExtractor, &SilentTaskHandler).unwrap_err();
        assert!(matches!(err, RecipeError::DownloadCountMismatch { expected: 1, actual: 0 }));
    }

    #[test]
    fn rejects_breakout_paths() {
        assert!(safe_relative_path("../escape").is_err());
        assert!(safe_relative_path("a/../../escape").is_err());
        assert!(safe_relative_path("/absolute").is_err());
        assert!(safe_relative_path("").is_err());
        assert_eq!(safe_relative_path("a/./b").unwrap(), PathBuf::from("a/b"));
    }

    #[test]
    fn temp_tree_is_deleted_on_drop() {
        let tree = TempTree::new().unwrap();
        let path = tree.path().to_path_buf();
        assert!(path.is_dir());
        drop(tree);
        assert!(!path.exists());
    }

    #[test]
    fn into_path_disarms_cleanup() {
        let tree = TempTree::new().unwrap();
        let path = tree.into_path();
        assert!(path.is_dir());
        fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn recipe_round_trips_through_json() {
        let recipe = Recipe::new(vec![
            RecipeStep::Archive {
                mime_type: "application/x-tar".into(),
                start_offset: 12,
                extract: Some("inner".into()),
                destination: None,
            },
            RecipeStep::Remove { path: "junk".into() },
        ]);
        let json = serde_json::to_string(&recipe).unwrap();
        assert_eq!(serde_json::from_str::<Recipe>(&json).unwrap(), recipe);
    }
}
