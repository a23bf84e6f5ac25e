//! Manifest model and serialization
//!
//! A manifest lists every file, directory and symlink of one directory tree
//! and contains a digest of each file's content. The digest of the
//! serialized manifest identifies the whole tree.

use crate::digest::ManifestDigest;
use crate::format::ManifestFormat;
use crate::generator::ManifestGenerator;
use crate::task::TaskHandler;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Name of the manifest file stored inside every committed implementation.
pub const MANIFEST_FILE: &str = ".manifest";

/// Errors that can occur while generating, saving or loading manifests
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("invalid line in manifest: '{0}'")]
    InvalidLine(String),

    #[error("name '{0}' must not contain newlines")]
    NewlineInName(String),

    #[error("'{0}' is neither a regular file, directory nor symlink")]
    UnsupportedFileType(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("problem accessing '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> ManifestError {
        let path = path.into();
        move |source| ManifestError::Io { path, source }
    }
}

/// A file entry of a manifest (normal or executable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFileEntry {
    /// Hex-encoded digest of the file content.
    pub digest: String,
    /// Modification time in seconds since the Unix epoch.
    pub modified_time: i64,
    /// File size in bytes.
    pub size: u64,
    /// File name without any path.
    pub name: String,
}

/// A symlink entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSymlinkEntry {
    /// Hex-encoded digest of the link target bytes.
    pub digest: String,
    /// Length of the link target in bytes.
    pub length: u64,
    /// Link name without any path.
    pub name: String,
}

/// A directory entry of a manifest. Only emitted by new-format walks;
/// the old format nests directories via sort order instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDirectoryEntry {
    /// Modification time in seconds since the Unix epoch.
    pub modified_time: i64,
    /// `/`-rooted path relative to the tree root, Unix slashes.
    pub full_path: String,
}

/// One node of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestNode {
    NormalFile(ManifestFileEntry),
    ExecutableFile(ManifestFileEntry),
    Symlink(ManifestSymlinkEntry),
    Directory(ManifestDirectoryEntry),
}

fn check_name(name: &str) -> Result<(), ManifestError> {
    if name.contains('\n') {
        Err(ManifestError::NewlineInName(name.to_string()))
    } else {
        Ok(())
    }
}

impl ManifestFileEntry {
    pub fn new(digest: String, modified_time: i64, size: u64, name: String) -> Result<Self, ManifestError> {
        check_name(&name)?;
        Ok(Self { digest, modified_time, size, name })
    }
}

impl ManifestSymlinkEntry {
    pub fn new(digest: String, length: u64, name: String) -> Result<Self, ManifestError> {
        check_name(&name)?;
        Ok(Self { digest, length, name })
    }
}

impl ManifestDirectoryEntry {
    pub fn new(modified_time: i64, full_path: String) -> Result<Self, ManifestError> {
        check_name(&full_path)?;
        Ok(Self { modified_time, full_path })
    }

    /// Parses a new-format directory line (`D <mtime> <path>`).
    pub fn from_line(line: &str) -> Result<Self, ManifestError> {
        let invalid = || ManifestError::InvalidLine(line.to_string());
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("D"), Some(mtime), Some(path)) if path.starts_with('/') => {
                let modified_time = mtime.parse().map_err(|_| invalid())?;
                Self::new(modified_time, path.to_string())
            }
            _ => Err(invalid()),
        }
    }

    /// Parses an old-format directory line.
    ///
    /// Legacy manifests share the `D <mtime> <path>` layout; kept as a
    /// separate entry point so old-format quirks stay isolated here.
    pub fn from_line_old(line: &str) -> Result<Self, ManifestError> {
        Self::from_line(line)
    }
}

impl ManifestNode {
    /// Renders the node as one manifest line (without the trailing newline).
    pub fn to_line(&self) -> String {
        match self {
            ManifestNode::NormalFile(file) => {
                format!("F {} {} {} {}", file.digest, file.modified_time, file.size, file.name)
            }
            ManifestNode::ExecutableFile(file) => {
                format!("X {} {} {} {}", file.digest, file.modified_time, file.size, file.name)
            }
            ManifestNode::Symlink(link) => {
                format!("S {} {} {}", link.digest, link.length, link.name)
            }
            ManifestNode::Directory(dir) => {
                format!("D {} {}", dir.modified_time, dir.full_path)
            }
        }
    }

    fn file_from_line(line: &str, executable: bool) -> Result<Self, ManifestError> {
        let invalid = || ManifestError::InvalidLine(line.to_string());
        let expected_kind = if executable { "X" } else { "F" };
        let mut parts = line.splitn(5, ' ');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(digest), Some(mtime), Some(size), Some(name))
                if kind == expected_kind && !digest.is_empty() =>
            {
                let entry = ManifestFileEntry::new(
                    digest.to_string(),
                    mtime.parse().map_err(|_| invalid())?,
                    size.parse().map_err(|_| invalid())?,
                    name.to_string(),
                )?;
                Ok(if executable {
                    ManifestNode::ExecutableFile(entry)
                } else {
                    ManifestNode::NormalFile(entry)
                })
            }
            _ => Err(invalid()),
        }
    }

    fn symlink_from_line(line: &str) -> Result<Self, ManifestError> {
        let invalid = || ManifestError::InvalidLine(line.to_string());
        let mut parts = line.splitn(4, ' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("S"), Some(digest), Some(length), Some(name)) if !digest.is_empty() => {
                Ok(ManifestNode::Symlink(ManifestSymlinkEntry::new(
                    digest.to_string(),
                    length.parse().map_err(|_| invalid())?,
                    name.to_string(),
                )?))
            }
            _ => Err(invalid()),
        }
    }
}

impl ManifestFormat {
    /// Renders one manifest line for a node according to the format family.
    pub fn generate_entry(self, node: &ManifestNode) -> String {
        node.to_line()
    }

    /// Parses a directory line according to the format family.
    pub fn read_directory_entry(self, line: &str) -> Result<ManifestDirectoryEntry, ManifestError> {
        if self.is_new_format() {
            ManifestDirectoryEntry::from_line(line)
        } else {
            ManifestDirectoryEntry::from_line_old(line)
        }
    }
}

/// An immutable, ordered list of manifest nodes for one tree snapshot.
///
/// Node order is exactly the order produced by the format's directory walk;
/// reordering changes the digest.
#[derive(Debug, Clone)]
pub struct Manifest {
    format: ManifestFormat,
    nodes: Vec<ManifestNode>,
    total_size: OnceLock<u64>,
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format && self.nodes == other.nodes
    }
}

impl Eq for Manifest {}

impl Manifest {
    pub fn new(format: ManifestFormat, nodes: Vec<ManifestNode>) -> Self {
        Self { format, nodes, total_size: OnceLock::new() }
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    pub fn nodes(&self) -> &[ManifestNode] {
        &self.nodes
    }

    /// The combined size of all files listed in the manifest, in bytes.
    pub fn total_size(&self) -> u64 {
        *self.total_size.get_or_init(|| {
            self.nodes
                .iter()
                .map(|node| match node {
                    ManifestNode::NormalFile(file) | ManifestNode::ExecutableFile(file) => file.size,
                    _ => 0,
                })
                .sum()
        })
    }

    /// Writes the manifest to a stream: UTF-8 without BOM, one `\n`-terminated
    /// line per node.
    pub fn save<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for node in &self.nodes {
            writer.write_all(self.format.generate_entry(node).as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Writes the manifest to a file and returns its digest identifier.
    ///
    /// The digest is computed from the bytes on disk after writing, so what
    /// is hashed is exactly what was stored.
    pub fn save_to_path(&self, path: &Path) -> Result<String, ManifestError> {
        let file = File::create(path).map_err(ManifestError::io(path))?;
        let mut writer = BufWriter::new(file);
        self.save(&mut writer).map_err(ManifestError::io(path))?;
        writer.flush().map_err(ManifestError::io(path))?;
        drop(writer);

        let mut file = File::open(path).map_err(ManifestError::io(path))?;
        let digest = self.format.digest_manifest(&mut file).map_err(ManifestError::io(path))?;
        Ok(digest_id(self.format, &digest))
    }

    /// Parses a manifest from a stream, line by line.
    pub fn load<R: BufRead>(reader: R, format: ManifestFormat) -> Result<Self, ManifestError> {
        let mut nodes = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|source| ManifestError::Io { path: PathBuf::new(), source })?;
            let node = match line.chars().next() {
                Some('F') => ManifestNode::file_from_line(&line, false)?,
                Some('X') => ManifestNode::file_from_line(&line, true)?,
                Some('S') => ManifestNode::symlink_from_line(&line)?,
                Some('D') => ManifestNode::Directory(format.read_directory_entry(&line)?),
                _ => return Err(ManifestError::InvalidLine(line)),
            };
            nodes.push(node);
        }
        Ok(Self::new(format, nodes))
    }

    /// Parses a manifest file.
    pub fn load_path(path: &Path, format: ManifestFormat) -> Result<Self, ManifestError> {
        let file = File::open(path).map_err(ManifestError::io(path))?;
        Self::load(BufReader::new(file), format)
    }

    /// Calculates the digest identifier for the manifest in-memory,
    /// equivalent to `save_to_path` without touching disk.
    pub fn calculate_digest(&self) -> String {
        let digest = self.format.digest_manifest_bytes(self.to_string().as_bytes());
        digest_id(self.format, &digest)
    }

    /// Generates manifests for every recommended format and folds the
    /// resulting digests into one `ManifestDigest`.
    pub fn create_digest(path: &Path, handler: &dyn TaskHandler) -> Result<ManifestDigest, ManifestError> {
        let mut digest = ManifestDigest::new();
        for format in ManifestFormat::RECOMMENDED {
            let manifest = ManifestGenerator::new(path, format).run(handler)?;
            digest.parse_id(&manifest.calculate_digest());
        }
        Ok(digest)
    }
}

/// Builds a digest identifier such as `sha256new_ABC...` from a raw digest value.
pub fn digest_id(format: ManifestFormat, digest: &str) -> String {
    format!("{}{}{}", format.prefix(), format.separator(), digest)
}

impl fmt::Display for Manifest {
    /// The same text representation as `save` produces.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{}", self.format.generate_entry(node))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn file_entry(name: &str) -> ManifestFileEntry {
        ManifestFileEntry::new("ab12".into(), 1234567890, 4, name.into()).unwrap()
    }

    fn sample_manifest(format: ManifestFormat) -> Manifest {
        Manifest::new(
            format,
            vec![
                ManifestNode::NormalFile(file_entry("a.txt")),
                ManifestNode::ExecutableFile(file_entry("run.sh")),
                ManifestNode::Symlink(ManifestSymlinkEntry::new("cd34".into(), 6, "link".into()).unwrap()),
                ManifestNode::Directory(ManifestDirectoryEntry::new(1234567890, "/sub".into()).unwrap()),
            ],
        )
    }

    #[test]
    fn line_rendering() {
        let manifest = sample_manifest(ManifestFormat::Sha256New);
        assert_eq!(
            manifest.to_string(),
            "F ab12 1234567890 4 a.txt\n\
             X ab12 1234567890 4 run.sh\n\
             S cd34 6 link\n\
             D 1234567890 /sub\n"
        );
    }

    #[test]
    fn round_trip_all_formats() {
        for format in ManifestFormat::ALL {
            let manifest = sample_manifest(format);
            let mut buffer = Vec::new();
            manifest.save(&mut buffer).unwrap();
            let loaded = Manifest::load(Cursor::new(buffer), format).unwrap();
            assert_eq!(loaded, manifest);
            assert_eq!(loaded.calculate_digest(), manifest.calculate_digest());
        }
    }

    #[test]
    fn names_may_contain_spaces() {
        let line = "F ab12 1234567890 4 a name with spaces.txt";
        let node = ManifestNode::file_from_line(line, false).unwrap();
        assert_eq!(node.to_line(), line);
    }

    #[test]
    fn rejects_malformed_lines() {
        let format = ManifestFormat::Sha256;
        for line in [
            "Q ab12 1 2 name",
            "F ab12 notanumber 2 name",
            "F ab12 1",
            "S ab12 name",
            "D name-without-time",
            "",
        ] {
            let input = format!("{line}\n");
            assert!(
                Manifest::load(Cursor::new(input.into_bytes()), format).is_err(),
                "line should be rejected: '{line}'"
            );
        }
    }

    #[test]
    fn rejects_newline_in_name() {
        assert!(matches!(
            ManifestFileEntry::new("ab".into(), 0, 0, "bad\nname".into()),
            Err(ManifestError::NewlineInName(_))
        ));
    }

    #[test]
    fn total_size_sums_files_only() {
        let manifest = sample_manifest(ManifestFormat::Sha256);
        assert_eq!(manifest.total_size(), 8);
    }

    #[test]
    fn digest_uses_format_separator() {
        let manifest = sample_manifest(ManifestFormat::Sha256New);
        assert!(manifest.calculate_digest().starts_with("sha256new_"));
        let manifest = sample_manifest(ManifestFormat::Sha1New);
        assert!(manifest.calculate_digest().starts_with("sha1new="));
    }

    #[test]
    fn equality_is_order_sensitive() {
        let mut nodes = sample_manifest(ManifestFormat::Sha256).nodes().to_vec();
        nodes.swap(0, 1);
        let reordered = Manifest::new(ManifestFormat::Sha256, nodes);
        assert_ne!(reordered, sample_manifest(ManifestFormat::Sha256));
        assert_ne!(
            reordered.calculate_digest(),
            sample_manifest(ManifestFormat::Sha256).calculate_digest()
        );
    }

    proptest! {
        #[test]
        fn file_lines_round_trip(
            digest in "[0-9a-f]{8,64}",
            mtime in proptest::num::i64::ANY,
            size in proptest::num::u64::ANY,
            name in "[a-zA-Z0-9 ._-]{1,32}",
        ) {
            let entry = ManifestFileEntry::new(digest, mtime, size, name).unwrap();
            let node = ManifestNode::NormalFile(entry);
            let parsed = ManifestNode::file_from_line(&node.to_line(), false).unwrap();
            prop_assert_eq!(parsed, node);
        }
    }
}
