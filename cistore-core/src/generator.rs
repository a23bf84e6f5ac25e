//! Manifest generation from live directory trees
//!
//! Walks a directory in the canonical order dictated by the manifest format,
//! hashing file contents and consulting external flag files for attributes
//! the filesystem cannot represent natively. Cancellation is cooperative:
//! checked before the walk, after the listing and before each entry.

use crate::flags::{self, SYMLINK_FILE, XBIT_FILE};
use crate::format::{ManifestFormat, WalkEntry};
use crate::manifest::{
    Manifest, ManifestDirectoryEntry, ManifestError, ManifestFileEntry, ManifestNode,
    ManifestSymlinkEntry, MANIFEST_FILE,
};
use crate::task::TaskHandler;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates a `Manifest` for a directory in the filesystem.
///
/// One generator instance corresponds to one logical unit of work; files are
/// hashed sequentially in canonical order so progress and digest input stay
/// deterministic.
pub struct ManifestGenerator {
    target_dir: PathBuf,
    format: ManifestFormat,
}

impl ManifestGenerator {
    /// Prepares to generate a manifest for the directory at `path`.
    pub fn new(path: impl Into<PathBuf>, format: ManifestFormat) -> Self {
        Self { target_dir: path.into(), format }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// Runs the walk to completion, blocking the calling thread.
    pub fn run(&self, handler: &dyn TaskHandler) -> Result<Manifest, ManifestError> {
        if handler.is_cancelled() {
            return Err(ManifestError::Cancelled);
        }

        let entries = self
            .format
            .sorted_entries(&self.target_dir)
            .map_err(ManifestError::io(&self.target_dir))?;

        if handler.is_cancelled() {
            return Err(ManifestError::Cancelled);
        }
        handler.begin_total(total_file_bytes(&entries));

        let xbits = flags::get_external_flags(XBIT_FILE, &self.target_dir)
            .map_err(ManifestError::io(&self.target_dir))?;
        let symlinks = flags::get_external_flags(SYMLINK_FILE, &self.target_dir)
            .map_err(ManifestError::io(&self.target_dir))?;

        let mut nodes = Vec::new();
        for entry in &entries {
            if handler.is_cancelled() {
                return Err(ManifestError::Cancelled);
            }

            match entry {
                WalkEntry::File(path) => {
                    // Manifest management files describe the tree, they are not part of it
                    if is_management_file(path) {
                        continue;
                    }
                    let (node, size) = self.file_node(path, &xbits, &symlinks)?;
                    nodes.push(node);
                    handler.report(size);
                }
                WalkEntry::Directory(path) => {
                    if let Some(node) = self.directory_node(path)? {
                        nodes.push(node);
                    }
                }
            }
        }

        Ok(Manifest::new(self.format, nodes))
    }

    fn file_node(
        &self,
        path: &Path,
        xbits: &HashSet<PathBuf>,
        symlinks: &HashSet<PathBuf>,
    ) -> Result<(ManifestNode, u64), ManifestError> {
        let meta = fs::symlink_metadata(path).map_err(ManifestError::io(path))?;

        // Real filesystem symlinks hash their target bytes; the target
        // length is what the announced total counted for them
        if meta.file_type().is_symlink() {
            return Ok((self.symlink_node(path)?, meta.len()));
        }

        if !meta.is_file() {
            return Err(ManifestError::UnsupportedFileType(path.to_path_buf()));
        }

        let name = file_name(path);
        let mut file = File::open(path).map_err(ManifestError::io(path))?;
        let digest = self.format.digest_content(&mut file).map_err(ManifestError::io(path))?;
        let size = meta.len();

        // Flagged placeholder files stand in for symlinks on filesystems
        // without native support; their content is the link target
        let node = if symlinks.contains(path) {
            ManifestNode::Symlink(ManifestSymlinkEntry::new(digest, size, name)?)
        } else {
            let modified = modified_unix_time(&meta, path)?;
            let entry = ManifestFileEntry::new(digest, modified, size, name)?;
            if xbits.contains(path) || is_native_executable(&meta) {
                ManifestNode::ExecutableFile(entry)
            } else {
                ManifestNode::NormalFile(entry)
            }
        };
        Ok((node, size))
    }

    fn directory_node(&self, path: &Path) -> Result<Option<ManifestNode>, ManifestError> {
        let meta = fs::symlink_metadata(path).map_err(ManifestError::io(path))?;

        // A directory can itself be a symlink; handled like a file symlink
        if meta.file_type().is_symlink() {
            return Ok(Some(self.symlink_node(path)?));
        }

        // The old format nests directories purely via traversal order
        if !self.format.is_new_format() {
            return Ok(None);
        }

        let modified = modified_unix_time(&meta, path)?;
        let full_path = self.rooted_path(path)?;
        Ok(Some(ManifestNode::Directory(ManifestDirectoryEntry::new(modified, full_path)?)))
    }

    fn symlink_node(&self, path: &Path) -> Result<ManifestNode, ManifestError> {
        let target = fs::read_link(path).map_err(ManifestError::io(path))?;
        let target_bytes = target.as_os_str().as_encoded_bytes();
        let digest = self.format.digest_content_bytes(target_bytes);
        Ok(ManifestNode::Symlink(ManifestSymlinkEntry::new(
            digest,
            target_bytes.len() as u64,
            file_name(path),
        )?))
    }

    /// `/`-rooted path relative to the walk root, Unix slashes on every platform.
    fn rooted_path(&self, path: &Path) -> Result<String, ManifestError> {
        let relative = path.strip_prefix(&self.target_dir).map_err(|_| ManifestError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "entry outside of the walk root",
            ),
        })?;
        let parts: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(format!("/{}", parts.join("/")))
    }
}

fn is_management_file(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|name| name.to_str()),
        Some(MANIFEST_FILE | XBIT_FILE | SYMLINK_FILE)
    )
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
}

fn total_file_bytes(entries: &[WalkEntry]) -> u64 {
    entries
        .iter()
        .filter_map(|entry| match entry {
            WalkEntry::File(path) => fs::symlink_metadata(path).ok().map(|meta| meta.len()),
            WalkEntry::Directory(_) => None,
        })
        .sum()
}

fn modified_unix_time(meta: &fs::Metadata, path: &Path) -> Result<i64, ManifestError> {
    let modified = meta.modified().map_err(ManifestError::io(path))?;
    Ok(unix_time(modified))
}

fn unix_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

#[cfg(unix)]
fn is_native_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_native_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CancellableHandler, CancellationToken, SilentTaskHandler};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    struct RecordingHandler {
        total: AtomicU64,
        processed: AtomicU64,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self { total: AtomicU64::new(0), processed: AtomicU64::new(0) }
        }
    }

    impl TaskHandler for RecordingHandler {
        fn begin_total(&self, total_bytes: u64) {
            self.total.store(total_bytes, Ordering::SeqCst);
        }

        fn report(&self, bytes: u64) {
            self.processed.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn management_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "payload.txt", "data");
        write(&dir, MANIFEST_FILE, "F bogus 0 0 x\n");
        write(&dir, XBIT_FILE, "");
        write(&dir, SYMLINK_FILE, "");

        let manifest = ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New)
            .run(&SilentTaskHandler)
            .unwrap();
        assert_eq!(manifest.nodes().len(), 1);
        assert!(matches!(&manifest.nodes()[0], ManifestNode::NormalFile(f) if f.name == "payload.txt"));
    }

    #[test]
    fn cancellation_before_start() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "data");

        let token = CancellationToken::new();
        token.cancel();
        let result = ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New)
            .run(&CancellableHandler::new(token));
        assert!(matches!(result, Err(ManifestError::Cancelled)));
    }

    #[test]
    fn progress_is_reported_in_bytes() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "1234");
        write(&dir, "b.txt", "123456");

        let handler = RecordingHandler::new();
        ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New)
            .run(&handler)
            .unwrap();
        assert_eq!(handler.total.load(Ordering::SeqCst), 10);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn xbit_flag_marks_file_executable() {
        let dir = TempDir::new().unwrap();
        write(&dir, "tool", "binary");
        flags::set_external_flag(&dir.path().join(XBIT_FILE), Path::new("tool")).unwrap();

        let manifest = ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New)
            .run(&SilentTaskHandler)
            .unwrap();
        assert!(matches!(&manifest.nodes()[0], ManifestNode::ExecutableFile(f) if f.name == "tool"));
    }

    #[test]
    fn old_format_omits_directory_nodes() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        write(&dir, "sub/inner.txt", "data");

        let old = ManifestGenerator::new(dir.path(), ManifestFormat::Sha1)
            .run(&SilentTaskHandler)
            .unwrap();
        assert!(old.nodes().iter().all(|node| !matches!(node, ManifestNode::Directory(_))));

        let new = ManifestGenerator::new(dir.path(), ManifestFormat::Sha1New)
            .run(&SilentTaskHandler)
            .unwrap();
        assert!(new
            .nodes()
            .iter()
            .any(|node| matches!(node, ManifestNode::Directory(d) if d.full_path == "/sub")));
    }

    #[cfg(unix)]
    #[test]
    fn progress_reaches_total_with_symlinks() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.txt", "1234");
        std::os::unix::fs::symlink("a.txt", dir.path().join("link")).unwrap();

        let handler = RecordingHandler::new();
        ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New)
            .run(&handler)
            .unwrap();
        // 4 content bytes plus the 5-byte link target
        assert_eq!(handler.total.load(Ordering::SeqCst), 9);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 9);
    }

    #[cfg(unix)]
    #[test]
    fn real_and_flagged_symlinks_hash_identically() {
        let real = TempDir::new().unwrap();
        write(&real, "a.txt", "data");
        std::os::unix::fs::symlink("a.txt", real.path().join("link")).unwrap();

        let flagged = TempDir::new().unwrap();
        write(&flagged, "a.txt", "data");
        write(&flagged, "link", "a.txt");
        flags::set_external_flag(&flagged.path().join(SYMLINK_FILE), Path::new("link")).unwrap();

        // Equalize mtimes so only the symlink representation can differ
        let epoch = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000);
        for dir in [&real, &flagged] {
            for name in ["a.txt", "link"] {
                let path = dir.path().join(name);
                if fs::symlink_metadata(&path).unwrap().file_type().is_symlink() {
                    continue;
                }
                File::open(&path).unwrap().set_modified(epoch).unwrap();
            }
        }

        let format = ManifestFormat::Sha256New;
        let from_real = ManifestGenerator::new(real.path(), format).run(&SilentTaskHandler).unwrap();
        let from_flagged =
            ManifestGenerator::new(flagged.path(), format).run(&SilentTaskHandler).unwrap();
        assert_eq!(from_real.calculate_digest(), from_flagged.calculate_digest());
    }

    #[cfg(unix)]
    #[test]
    fn unsupported_file_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let status = std::process::Command::new("mkfifo")
            .arg(dir.path().join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let result =
            ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New).run(&SilentTaskHandler);
        assert!(matches!(result, Err(ManifestError::UnsupportedFileType(_))));
    }

    #[test]
    fn determinism_across_runs() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.txt", "bbb");
        write(&dir, "a.txt", "aaa");
        fs::create_dir(dir.path().join("sub")).unwrap();
        write(&dir, "sub/c.txt", "ccc");

        let generator = ManifestGenerator::new(dir.path(), ManifestFormat::Sha256New);
        let first = generator.run(&SilentTaskHandler).unwrap();
        let second = generator.run(&SilentTaskHandler).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.calculate_digest(), second.calculate_digest());
    }
}
