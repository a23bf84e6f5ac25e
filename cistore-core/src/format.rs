//! Manifest format generations
//!
//! Encapsulates the differences between the digest formats that can be used
//! to save and load manifests: the hash algorithm, the digest prefix and
//! separator, and the canonical directory traversal order.

use crate::digest::{DigestError, SHA1_NEW_PREFIX, SHA1_PREFIX, SHA256_NEW_PREFIX, SHA256_PREFIX};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// One generation of the manifest format, listed in `ALL` from best to worst.
///
/// The old format (`Sha1`) interleaves files and directories in a single
/// C-sorted pass; the new formats list files before subdirectories at every
/// level. `Sha256New` additionally base32-encodes the final manifest digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestFormat {
    Sha1,
    Sha1New,
    Sha256,
    Sha256New,
}

/// One entry of a canonically ordered directory listing.
///
/// The classification follows the position the entry takes in the listing:
/// symlinks pointing at directories are listed as `Directory` but are never
/// recursed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    File(PathBuf),
    Directory(PathBuf),
}

impl WalkEntry {
    pub fn path(&self) -> &Path {
        match self {
            WalkEntry::File(path) | WalkEntry::Directory(path) => path,
        }
    }
}

impl ManifestFormat {
    /// All supported formats, from best (safest) to worst.
    pub const ALL: [ManifestFormat; 4] = [
        ManifestFormat::Sha256New,
        ManifestFormat::Sha256,
        ManifestFormat::Sha1New,
        ManifestFormat::Sha1,
    ];

    /// All supported and non-deprecated formats, from best to worst.
    pub const RECOMMENDED: [ManifestFormat; 3] =
        [ManifestFormat::Sha256New, ManifestFormat::Sha256, ManifestFormat::Sha1New];

    /// Selects the format matching a digest identifier or bare prefix.
    pub fn from_prefix(id: &str) -> Result<Self, DigestError> {
        Self::ALL
            .into_iter()
            .find(|format| id.starts_with(format.prefix()))
            .ok_or_else(|| DigestError::NotADigest(id.to_string()))
    }

    /// The prefix identifying the format (e.g. `sha256`).
    pub fn prefix(self) -> &'static str {
        match self {
            ManifestFormat::Sha1 => SHA1_PREFIX,
            ManifestFormat::Sha1New => SHA1_NEW_PREFIX,
            ManifestFormat::Sha256 => SHA256_PREFIX,
            ManifestFormat::Sha256New => SHA256_NEW_PREFIX,
        }
    }

    /// The separator placed between the prefix and the digest value.
    pub fn separator(self) -> char {
        match self {
            ManifestFormat::Sha256New => '_',
            _ => '=',
        }
    }

    /// Whether the format uses the new manifest layout
    /// (files before subdirectories, explicit directory entries).
    pub fn is_new_format(self) -> bool {
        !matches!(self, ManifestFormat::Sha1)
    }

    /// Hashes the content of an implementation file as referenced within a
    /// manifest. Always hex-encoded.
    pub fn digest_content<R: Read + ?Sized>(self, reader: &mut R) -> io::Result<String> {
        Ok(hex::encode(self.hash_reader(reader)?))
    }

    /// Hashes a serialized manifest as used for the implementation directory
    /// name. Hex-encoded, except for `Sha256New` which uses base32.
    pub fn digest_manifest<R: Read + ?Sized>(self, reader: &mut R) -> io::Result<String> {
        let hash = self.hash_reader(reader)?;
        Ok(match self {
            ManifestFormat::Sha256New => {
                base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &hash)
            }
            _ => hex::encode(hash),
        })
    }

    /// Hashes in-memory file content, e.g. symlink target bytes.
    pub fn digest_content_bytes(self, data: &[u8]) -> String {
        hex::encode(self.hash_bytes(data))
    }

    /// Hashes an in-memory serialized manifest.
    pub fn digest_manifest_bytes(self, data: &[u8]) -> String {
        let hash = self.hash_bytes(data);
        match self {
            ManifestFormat::Sha256New => {
                base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &hash)
            }
            _ => hex::encode(hash),
        }
    }

    fn hash_bytes(self, data: &[u8]) -> Vec<u8> {
        match self {
            ManifestFormat::Sha1 | ManifestFormat::Sha1New => Sha1::digest(data).to_vec(),
            ManifestFormat::Sha256 | ManifestFormat::Sha256New => Sha256::digest(data).to_vec(),
        }
    }

    fn hash_reader<R: Read + ?Sized>(self, reader: &mut R) -> io::Result<Vec<u8>> {
        enum Hasher {
            Sha1(Sha1),
            Sha256(Sha256),
        }

        let mut hasher = match self {
            ManifestFormat::Sha1 | ManifestFormat::Sha1New => Hasher::Sha1(Sha1::new()),
            ManifestFormat::Sha256 | ManifestFormat::Sha256New => Hasher::Sha256(Sha256::new()),
        };

        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            match &mut hasher {
                Hasher::Sha1(h) => h.update(&buffer[..read]),
                Hasher::Sha256(h) => h.update(&buffer[..read]),
            }
        }

        Ok(match hasher {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        })
    }

    /// Creates a recursive list of all filesystem entries below `root` in the
    /// exact order required for canonical hashing.
    ///
    /// The order is the hashing contract: path segments are compared as raw
    /// bytes, never locale-aware.
    pub fn sorted_entries(self, root: &Path) -> io::Result<Vec<WalkEntry>> {
        let mut result = Vec::new();
        if self.is_new_format() {
            collect_new_format(root, &mut result)?;
        } else {
            collect_old_format(root, &mut result)?;
        }
        Ok(result)
    }
}

/// Reads the immediate children of a directory, C-sorted by name bytes.
fn sorted_children(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        children.push(entry?.path());
    }
    children.sort_by(|a, b| name_bytes(a).cmp(name_bytes(b)));
    Ok(children)
}

fn name_bytes(path: &Path) -> &[u8] {
    path.file_name().map(|name| name.as_encoded_bytes()).unwrap_or_default()
}

/// Whether the entry occupies a directory position in the listing.
/// Follows symlinks, like the traversal order it feeds.
fn is_directory_position(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_dir()).unwrap_or(false)
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Old format: one merged C-sorted list per level, recursing into each
/// directory immediately after listing it.
fn collect_old_format(dir: &Path, result: &mut Vec<WalkEntry>) -> io::Result<()> {
    for child in sorted_children(dir)? {
        if is_directory_position(&child) {
            let recurse = !is_symlink(&child);
            result.push(WalkEntry::Directory(child.clone()));
            if recurse {
                collect_old_format(&child, result)?;
            }
        } else {
            result.push(WalkEntry::File(child));
        }
    }
    Ok(())
}

/// New format: all files of a level C-sorted first, then each subdirectory
/// C-sorted and recursed into depth-first.
fn collect_new_format(dir: &Path, result: &mut Vec<WalkEntry>) -> io::Result<()> {
    let mut files = Vec::new();
    let mut directories = Vec::new();
    for child in sorted_children(dir)? {
        if is_directory_position(&child) {
            directories.push(child);
        } else {
            files.push(child);
        }
    }

    result.extend(files.into_iter().map(WalkEntry::File));
    for directory in directories {
        let recurse = !is_symlink(&directory);
        result.push(WalkEntry::Directory(directory.clone()));
        if recurse {
            collect_new_format(&directory, result)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn names(entries: &[WalkEntry], root: &Path) -> Vec<String> {
        entries
            .iter()
            .map(|entry| {
                entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/")
            })
            .collect()
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("zebra.txt")).unwrap();
        File::create(dir.path().join("alpha.txt")).unwrap();
        fs::create_dir(dir.path().join("beta")).unwrap();
        File::create(dir.path().join("beta/inner.txt")).unwrap();
        fs::create_dir(dir.path().join("beta/nested")).unwrap();
        File::create(dir.path().join("beta/nested/deep.txt")).unwrap();
        dir
    }

    #[test]
    fn from_prefix_distinguishes_generations() {
        assert_eq!(ManifestFormat::from_prefix("sha256new_ABC").unwrap(), ManifestFormat::Sha256New);
        assert_eq!(ManifestFormat::from_prefix("sha256=abc").unwrap(), ManifestFormat::Sha256);
        assert_eq!(ManifestFormat::from_prefix("sha1new=abc").unwrap(), ManifestFormat::Sha1New);
        assert_eq!(ManifestFormat::from_prefix("sha1=abc").unwrap(), ManifestFormat::Sha1);
        assert!(ManifestFormat::from_prefix("md5=abc").is_err());
    }

    #[test]
    fn old_format_interleaves_directories() {
        let dir = sample_tree();
        let entries = ManifestFormat::Sha1.sorted_entries(dir.path()).unwrap();
        assert_eq!(
            names(&entries, dir.path()),
            vec!["alpha.txt", "beta", "beta/inner.txt", "beta/nested", "beta/nested/deep.txt", "zebra.txt"]
        );
    }

    #[test]
    fn new_format_lists_files_before_directories() {
        let dir = sample_tree();
        let entries = ManifestFormat::Sha256New.sorted_entries(dir.path()).unwrap();
        assert_eq!(
            names(&entries, dir.path()),
            vec!["alpha.txt", "zebra.txt", "beta", "beta/inner.txt", "beta/nested", "beta/nested/deep.txt"]
        );
    }

    #[test]
    fn content_digest_is_hex() {
        // SHA-256 of "test"
        let digest = ManifestFormat::Sha256New.digest_content(&mut "test".as_bytes()).unwrap();
        assert_eq!(digest, "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08");
    }

    #[test]
    fn manifest_digest_encoding_differs_per_format() {
        let hex = ManifestFormat::Sha256.digest_manifest(&mut "test".as_bytes()).unwrap();
        assert_eq!(hex, "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08");

        let b32 = ManifestFormat::Sha256New.digest_manifest(&mut "test".as_bytes()).unwrap();
        assert!(b32.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(!b32.contains('='));
    }

    #[test]
    fn separators() {
        assert_eq!(ManifestFormat::Sha256New.separator(), '_');
        assert_eq!(ManifestFormat::Sha256.separator(), '=');
        assert_eq!(ManifestFormat::Sha1New.separator(), '=');
        assert_eq!(ManifestFormat::Sha1.separator(), '=');
    }
}
