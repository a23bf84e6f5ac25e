//! Content-Addressed Implementation Store
//!
//! Core functionality for caching implementations (directory trees) under
//! digests of their canonical manifests, including:
//! - Manifest digest identifiers across four digest formats
//! - Deterministic manifest generation from directory trees
//! - External flag files for filesystems without executable bits/symlinks
//! - On-disk store with stage→verify→commit semantics and write protection
//! - Composite store aggregating multiple cache directories
//! - Recipe application for multi-step implementation assembly

pub mod archive;
pub mod composite;
pub mod digest;
pub mod directory_store;
pub mod flags;
pub mod format;
pub mod generator;
pub mod manifest;
pub mod recipe;
pub mod store;
pub mod task;

pub use archive::{ArchiveSource, Extractor};
pub use composite::CompositeStore;
pub use digest::{DigestError, ManifestDigest};
pub use directory_store::{DirectoryStore, StoreKind};
pub use format::ManifestFormat;
pub use generator::ManifestGenerator;
pub use manifest::{Manifest, ManifestError, ManifestNode, MANIFEST_FILE};
pub use recipe::{apply_recipe, Recipe, RecipeError, RecipeStep, TempTree};
pub use store::{AuditMismatch, Store, StoreError};
pub use task::{CancellableHandler, CancellationToken, SilentTaskHandler, TaskHandler};
