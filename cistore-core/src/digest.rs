//! Manifest digest identifiers
//!
//! A `ManifestDigest` bundles the hashes of one implementation under all
//! recognized digest algorithms, ordered best to worst.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the legacy SHA-1 digest format.
pub const SHA1_PREFIX: &str = "sha1";

/// Prefix of the SHA-1 digest format with the new manifest layout.
pub const SHA1_NEW_PREFIX: &str = "sha1new";

/// Prefix of the SHA-256 digest format (hex-encoded).
pub const SHA256_PREFIX: &str = "sha256";

/// Prefix of the SHA-256 digest format with base32-encoded manifest digests.
pub const SHA256_NEW_PREFIX: &str = "sha256new";

/// Errors that can occur while parsing digest identifiers
#[derive(Debug, Clone, thiserror::Error)]
pub enum DigestError {
    #[error("'{0}' does not contain any known digest method")]
    NotADigest(String),
}

/// The hashes of one implementation under the recognized digest algorithms.
///
/// At least one entry must be present before the digest can be used for
/// store lookups. Algorithms are ranked `sha256new` > `sha256` > `sha1new`
/// > `sha1` for selection and serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestDigest {
    /// Hash for the deprecated `sha1` format, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,

    /// Hash for the `sha1new` format, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1_new: Option<String>,

    /// Hash for the `sha256` format, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Hash for the `sha256new` format, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_new: Option<String>,
}

impl ManifestDigest {
    /// Creates an empty digest with no known hashes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a digest identifier such as `sha256new_ABC...` or `sha1=abc...`.
    ///
    /// Fails if the identifier carries no recognized algorithm prefix.
    pub fn from_id(id: &str) -> Result<Self, DigestError> {
        let mut digest = Self::new();
        digest.parse_id(id);
        if digest.is_empty() {
            Err(DigestError::NotADigest(id.to_string()))
        } else {
            Ok(digest)
        }
    }

    /// Merges a digest identifier into this structure.
    ///
    /// Unrecognized prefixes are ignored and existing values are never
    /// overwritten.
    pub fn parse_id(&mut self, id: &str) {
        // Check the best algorithm first; "sha256new_x" also starts with "sha256"
        if let Some(hash) = strip_digest_prefix(id, SHA256_NEW_PREFIX, '_') {
            self.sha256_new.get_or_insert_with(|| hash.to_string());
        } else if let Some(hash) = strip_digest_prefix(id, SHA256_PREFIX, '=') {
            self.sha256.get_or_insert_with(|| hash.to_string());
        } else if let Some(hash) = strip_digest_prefix(id, SHA1_NEW_PREFIX, '=') {
            self.sha1_new.get_or_insert_with(|| hash.to_string());
        } else if let Some(hash) = strip_digest_prefix(id, SHA1_PREFIX, '=') {
            self.sha1.get_or_insert_with(|| hash.to_string());
        }
    }

    /// Whether no hash is known for any algorithm.
    pub fn is_empty(&self) -> bool {
        self.sha1.is_none() && self.sha1_new.is_none() && self.sha256.is_none() && self.sha256_new.is_none()
    }

    /// All known digest identifiers, listed from best to worst algorithm.
    pub fn available_digests(&self) -> Vec<String> {
        let mut result = Vec::new();
        if let Some(hash) = &self.sha256_new {
            result.push(format!("{SHA256_NEW_PREFIX}_{hash}"));
        }
        if let Some(hash) = &self.sha256 {
            result.push(format!("{SHA256_PREFIX}={hash}"));
        }
        if let Some(hash) = &self.sha1_new {
            result.push(format!("{SHA1_NEW_PREFIX}={hash}"));
        }
        if let Some(hash) = &self.sha1 {
            result.push(format!("{SHA1_PREFIX}={hash}"));
        }
        result
    }

    /// The best known digest identifier, if any.
    pub fn best(&self) -> Option<String> {
        self.available_digests().into_iter().next()
    }
}

fn strip_digest_prefix<'a>(id: &'a str, prefix: &str, separator: char) -> Option<&'a str> {
    let rest = id.strip_prefix(prefix)?;
    let hash = rest.strip_prefix(separator)?;
    if hash.is_empty() { None } else { Some(hash) }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.best() {
            Some(digest) => write!(f, "{digest}"),
            None => write!(f, "(no digest)"),
        }
    }
}
