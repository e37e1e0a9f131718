//! Incremental vector reuse.
//!
//! A prior build's vectors are reusable when the destination still holds
//! `manifest.json`, `docs.jsonl`, and `vectors.f16.bin`, and the prior
//! embedding model and `max_seq_length` match the current configuration.
//! Content identity (the chunk's text hash) is the reuse key; chunk ids do
//! not participate.

use crate::error::Result;
use cpm_packet::{
    read_docs_jsonl, read_vectors_f16, PacketManifest, DOCS_FILE, MANIFEST_FILE, VECTORS_FILE,
};
use std::collections::HashMap;
use std::path::Path;

pub struct PriorVectors {
    pub dim: usize,
    by_hash: HashMap<String, Vec<f32>>,
}

impl PriorVectors {
    #[must_use]
    pub fn get(&self, hash: &str) -> Option<&Vec<f32>> {
        self.by_hash.get(hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Prior hashes that no longer appear in `current`, i.e. the `removed`
    /// count of the incremental stats.
    #[must_use]
    pub fn removed_count(&self, current_hashes: &[String]) -> usize {
        let current: std::collections::HashSet<&str> =
            current_hashes.iter().map(String::as_str).collect();
        self.by_hash
            .keys()
            .filter(|hash| !current.contains(hash.as_str()))
            .count()
    }
}

/// Load the prior build state if it is compatible with the current model
/// configuration. Returns `None` (cache disabled) on any missing file,
/// parse failure, or compatibility mismatch.
pub fn try_load_prior(
    dest: &Path,
    model: &str,
    max_seq_length: Option<u32>,
) -> Result<Option<PriorVectors>> {
    let manifest_path = dest.join(MANIFEST_FILE);
    let docs_path = dest.join(DOCS_FILE);
    let vectors_path = dest.join(VECTORS_FILE);
    if !(manifest_path.exists() && docs_path.exists() && vectors_path.exists()) {
        return Ok(None);
    }

    let manifest: PacketManifest =
        match std::fs::read_to_string(&manifest_path).ok().and_then(|raw| {
            serde_json::from_str(&raw).ok()
        }) {
            Some(manifest) => manifest,
            None => return Ok(None),
        };

    if manifest.embedding.model != model || manifest.embedding.max_seq_length != max_seq_length {
        log::debug!(
            "incremental cache disabled: prior model {}/{:?} vs current {model}/{max_seq_length:?}",
            manifest.embedding.model,
            manifest.embedding.max_seq_length
        );
        return Ok(None);
    }

    let dim = manifest.embedding.dim as usize;
    let chunks = match read_docs_jsonl(&docs_path) {
        Ok(chunks) => chunks,
        Err(err) => {
            log::warn!("incremental cache disabled: unreadable docs.jsonl ({err})");
            return Ok(None);
        }
    };
    let rows = match read_vectors_f16(&vectors_path, dim) {
        Ok(rows) => rows,
        Err(err) => {
            log::warn!("incremental cache disabled: unreadable vectors ({err})");
            return Ok(None);
        }
    };
    if rows.len() != chunks.len() {
        log::warn!(
            "incremental cache disabled: {} docs vs {} vector rows",
            chunks.len(),
            rows.len()
        );
        return Ok(None);
    }

    // Duplicate hashes keep the first row, which is fine for reuse.
    let mut by_hash = HashMap::with_capacity(chunks.len());
    for (chunk, row) in chunks.into_iter().zip(rows.into_iter()) {
        by_hash.entry(chunk.hash).or_insert(row);
    }

    Ok(Some(PriorVectors { dim, by_hash }))
}
