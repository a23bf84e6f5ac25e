//! External flag files (`.xbit`, `.symlink`)
//!
//! Sidecar text files recording file attributes the host filesystem cannot
//! natively store: executable bits and symlinks. Each line is a `/`-rooted
//! Unix-slash path relative to the flag file's own directory. UTF-8 without
//! BOM, `\n` line endings.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Name of the flag file listing executable files.
pub const XBIT_FILE: &str = ".xbit";

/// Name of the flag file listing symlink placeholder files.
pub const SYMLINK_FILE: &str = ".symlink";

/// Returns the absolute paths of all files flagged in the closest flag file
/// named `name`, searching upward from `target` toward the filesystem root.
///
/// Returns an empty set if no ancestor carries such a flag file.
pub fn get_external_flags(name: &str, target: &Path) -> io::Result<HashSet<PathBuf>> {
    let Some(flag_dir) = find_flag_dir(name, target) else {
        return Ok(HashSet::new());
    };

    let mut flagged = HashSet::new();
    let reader = BufReader::new(File::open(flag_dir.join(name))?);
    for line in reader.lines() {
        let line = line?;
        // Each line names one flagged file, rooted at the flag file's directory
        if let Some(relative) = line.strip_prefix('/') {
            flagged.insert(flag_dir.join(native_path(relative)));
        }
    }
    Ok(flagged)
}

/// Walks upward from `target` until a directory containing `name` is found.
fn find_flag_dir(name: &str, target: &Path) -> Option<PathBuf> {
    target
        .ancestors()
        .find(|dir| dir.join(name).is_file())
        .map(Path::to_path_buf)
}

/// Appends a flag entry for `relative_path` to the flag file at `file`.
///
/// `relative_path` must be relative; it is recorded in `/`-rooted Unix form.
pub fn set_external_flag(file: &Path, relative_path: &Path) -> io::Result<()> {
    let entry = rooted_unix_path(relative_path)?;
    let flag_file = OpenOptions::new().create(true).append(true).open(file)?;
    let mut writer = BufWriter::new(flag_file);
    writer.write_all(entry.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Removes the flag entry for `relative_path` (and anything below it),
/// preserving all other lines byte-for-byte. No-op if the file is absent.
pub fn remove_external_flag(file: &Path, relative_path: &Path) -> io::Result<()> {
    let removed = rooted_unix_path(relative_path)?;
    rewrite_flag_file(file, |line| {
        if line == removed || line.starts_with(&format!("{removed}/")) {
            None
        } else {
            Some(line.to_string())
        }
    })
}

/// Rewrites flag entries for `source` (and anything below it) to point at
/// `destination` instead. No-op if the file is absent.
pub fn rename_external_flag(file: &Path, source: &Path, destination: &Path) -> io::Result<()> {
    let source = rooted_unix_path(source)?;
    let destination = rooted_unix_path(destination)?;
    rewrite_flag_file(file, |line| {
        if line == source {
            Some(destination.clone())
        } else if let Some(rest) = line.strip_prefix(&format!("{source}/")) {
            Some(format!("{destination}/{rest}"))
        } else {
            Some(line.to_string())
        }
    })
}

/// Rewrites a flag file through a same-directory temporary file and an
/// atomic rename, applying `transform` to each `/`-rooted line.
fn rewrite_flag_file(
    file: &Path,
    transform: impl Fn(&str) -> Option<String>,
) -> io::Result<()> {
    if !file.exists() {
        return Ok(());
    }

    let temp_path = file.with_file_name(format!(".flags-{}", Uuid::new_v4().simple()));
    let result = (|| {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        let reader = BufReader::new(File::open(file)?);
        for line in reader.lines() {
            let line = line?;
            if !line.starts_with('/') {
                continue;
            }
            if let Some(kept) = transform(&line) {
                writer.write_all(kept.as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&temp_path, file)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Converts a relative native path to its `/`-rooted Unix-slash flag form.
fn rooted_unix_path(relative_path: &Path) -> io::Result<String> {
    if relative_path.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("flag path must be relative: '{}'", relative_path.display()),
        ));
    }
    let mut parts = Vec::new();
    for component in relative_path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("flag path must not leave its directory: '{}'", relative_path.display()),
                ));
            }
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Converts a Unix-slash flag entry back to a native relative path.
fn native_path(unix_path: &str) -> PathBuf {
    unix_path.split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_then_remove_restores_file() {
        let dir = TempDir::new().unwrap();
        let flag_file = dir.path().join(XBIT_FILE);
        fs::write(&flag_file, "/keep/one\n/keep/two\n").unwrap();
        let before = fs::read(&flag_file).unwrap();

        set_external_flag(&flag_file, Path::new("added/file")).unwrap();
        assert_eq!(
            fs::read_to_string(&flag_file).unwrap(),
            "/keep/one\n/keep/two\n/added/file\n"
        );

        remove_external_flag(&flag_file, Path::new("added/file")).unwrap();
        assert_eq!(fs::read(&flag_file).unwrap(), before);
    }

    #[test]
    fn remove_drops_nested_entries() {
        let dir = TempDir::new().unwrap();
        let flag_file = dir.path().join(SYMLINK_FILE);
        fs::write(&flag_file, "/a\n/a/nested\n/ab\n").unwrap();

        remove_external_flag(&flag_file, Path::new("a")).unwrap();
        assert_eq!(fs::read_to_string(&flag_file).unwrap(), "/ab\n");
    }

    #[test]
    fn rename_rewrites_prefixed_entries() {
        let dir = TempDir::new().unwrap();
        let flag_file = dir.path().join(XBIT_FILE);
        fs::write(&flag_file, "/old\n/old/sub\n/other\n").unwrap();

        rename_external_flag(&flag_file, Path::new("old"), Path::new("new")).unwrap();
        assert_eq!(fs::read_to_string(&flag_file).unwrap(), "/new\n/new/sub\n/other\n");
    }

    #[test]
    fn flags_resolve_against_ancestor() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join(XBIT_FILE), "/a/b/tool\n").unwrap();

        let flags = get_external_flags(XBIT_FILE, &nested).unwrap();
        assert!(flags.contains(&dir.path().join("a/b/tool")));
    }

    #[test]
    fn closest_ancestor_wins() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join(XBIT_FILE), "/outer\n").unwrap();
        fs::write(nested.join(XBIT_FILE), "/inner\n").unwrap();

        let flags = get_external_flags(XBIT_FILE, &nested).unwrap();
        assert_eq!(flags, HashSet::from([nested.join("inner")]));
    }

    #[test]
    fn missing_flag_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(get_external_flags(XBIT_FILE, dir.path()).unwrap().is_empty());
    }

    #[test]
    fn rejects_absolute_flag_paths() {
        let dir = TempDir::new().unwrap();
        let flag_file = dir.path().join(XBIT_FILE);
        assert!(set_external_flag(&flag_file, Path::new("/absolute")).is_err());
    }
}
