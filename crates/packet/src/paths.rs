//! `CPM_ROOT` cache layout.
//!
//! ```text
//! CPM_ROOT/
//!   cas/<digest>/payload/...               immutable packet files
//!   index/<digest>/<embedding_fp>/         index + lock
//!   meta/<digest>/packet.manifest.json     normalized metadata
//!   cache/metadata/<digest>.json           resolver metadata cache
//!   cache/metadata_alias/<alias_hash>.json TTL alias cache
//! ```
//!
//! The root is the only process-wide resolution; every component takes a
//! `CpmPaths` explicitly instead of reading the environment on its own.

use std::path::{Path, PathBuf};

pub const DEFAULT_CPM_ROOT: &str = ".cpm";
pub const PACKET_METADATA_FILE: &str = "packet.manifest.json";

#[derive(Debug, Clone)]
pub struct CpmPaths {
    root: PathBuf,
}

impl CpmPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve from `CPM_ROOT`, falling back to the legacy `RAG_CPM_DIR`,
    /// then the default `.cpm`.
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("CPM_ROOT") {
            if !path.trim().is_empty() {
                return Self::new(path);
            }
        }
        if let Ok(path) = std::env::var("RAG_CPM_DIR") {
            if !path.trim().is_empty() {
                return Self::new(path);
            }
        }
        Self::new(DEFAULT_CPM_ROOT)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn cas_payload_dir(&self, digest: &str) -> PathBuf {
        self.root
            .join("cas")
            .join(safe_key(digest))
            .join("payload")
    }

    #[must_use]
    pub fn cas_lock_path(&self, digest: &str) -> PathBuf {
        self.root
            .join("cas")
            .join(format!("{}.lock", safe_key(digest)))
    }

    #[must_use]
    pub fn index_dir(&self, digest: &str, embedding_fingerprint: &str) -> PathBuf {
        self.root
            .join("index")
            .join(safe_key(digest))
            .join(embedding_fingerprint)
    }

    #[must_use]
    pub fn meta_path(&self, digest: &str) -> PathBuf {
        self.root
            .join("meta")
            .join(safe_key(digest))
            .join(PACKET_METADATA_FILE)
    }

    #[must_use]
    pub fn metadata_cache_path(&self, digest: &str) -> PathBuf {
        self.root
            .join("cache")
            .join("metadata")
            .join(format!("{}.json", safe_key(digest)))
    }

    #[must_use]
    pub fn alias_cache_path(&self, alias_hash: &str) -> PathBuf {
        self.root
            .join("cache")
            .join("metadata_alias")
            .join(format!("{alias_hash}.json"))
    }
}

/// Filesystem-safe rendition of a digest or ref segment.
#[must_use]
pub fn safe_key(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
