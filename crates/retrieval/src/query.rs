//! The query path: cache-hit search over a materialized digest, remote
//! materialization on miss, and the single-writer index rebuild.

use crate::docs_index::DocsIndex;
use crate::error::{Result, RetrievalError};
use cpm_embeddings::{EmbedHints, EmbeddingClient};
use cpm_oci::cas::acquire_digest_lock;
use cpm_oci::{OciRef, SourceResolver};
use cpm_packet::{
    EmbeddingSpec, FlatIpIndex, PacketManifest, VectorDtype, DOCS_FILE, INDEX_FILE, MANIFEST_FILE,
    VECTORS_FILE,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const MAX_QUERY_K: usize = 20;
pub const SNIPPET_MAX_CHARS: usize = 300;
const INDEX_FILE_NAME: &str = "index.faiss";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub score: f32,
    pub path: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub cache_hit: bool,
    pub pinned_uri: String,
    pub digest: String,
    pub results: Vec<QueryHit>,
}

pub struct QueryEngine {
    resolver: SourceResolver,
    embedder: EmbeddingClient,
}

impl QueryEngine {
    pub fn new(resolver: SourceResolver, embedder: EmbeddingClient) -> Self {
        Self { resolver, embedder }
    }

    #[must_use]
    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    #[must_use]
    pub fn embedder(&self) -> &EmbeddingClient {
        &self.embedder
    }

    /// Execute a query against a packet ref. `k` is clamped to `[1, 20]`.
    pub async fn query(&self, reference: &OciRef, q: &str, k: usize) -> Result<QueryResult> {
        if q.trim().is_empty() {
            return Err(RetrievalError::InvalidInput("empty query".to_string()));
        }
        let k = k.clamp(1, MAX_QUERY_K);

        let digest = self.resolver.resolve_digest(reference).await?;
        let pinned_uri = reference.pinned_uri(&digest);

        let query_vector = self
            .embedder
            .embed_one(q, &EmbedHints::default())
            .await?;
        let fingerprint = self.fingerprint(query_vector.len() as u32);

        let payload_dir = self.resolver.paths().cas_payload_dir(&digest);
        let index_dir = self.resolver.paths().index_dir(&digest, &fingerprint);
        let index_file = index_dir.join(INDEX_FILE_NAME);

        // Fast path: payload and per-fingerprint index already on disk.
        let cache_hit = payload_dir.join(MANIFEST_FILE).exists() && index_file.exists();
        if !cache_hit {
            let materialized = self.resolver.resolve_and_fetch(reference).await?;
            debug_assert_eq!(materialized.digest, digest);
            self.ensure_index(&materialized.payload_dir, &index_dir, query_vector.len())
                .await?;
        }

        let results = self.search_collated(&payload_dir, &index_file, &query_vector, k)?;
        Ok(QueryResult {
            cache_hit,
            pinned_uri,
            digest,
            results,
        })
    }

    fn fingerprint(&self, dim: u32) -> String {
        EmbeddingSpec {
            provider: String::new(),
            model: self.embedder.model().to_string(),
            dim,
            dtype: VectorDtype::F32,
            normalized: true,
            max_seq_length: self.embedder.max_seq_length(),
        }
        .fingerprint()
    }

    /// Guarantee `index/<digest>/<fp>/index.faiss` exists: mirror the
    /// packet-shipped index when its embedding spec matches the query-time
    /// embedder, otherwise rebuild from `docs.jsonl` under the rebuild lock.
    async fn ensure_index(
        &self,
        payload_dir: &Path,
        index_dir: &Path,
        query_dim: usize,
    ) -> Result<()> {
        let index_file = index_dir.join(INDEX_FILE_NAME);
        if index_file.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(index_dir)?;

        // Single rebuilder per (digest, fingerprint); a cancelled rebuild
        // leaves no index.faiss, so the next query restarts it here.
        let _lock = acquire_digest_lock(index_dir.join(".lock")).await?;
        if index_file.exists() {
            return Ok(());
        }

        if let Some(shipped) = self.shipped_index_if_compatible(payload_dir, query_dim) {
            std::fs::copy(&shipped, &index_file)?;
            let shipped_vectors = payload_dir.join(VECTORS_FILE);
            if shipped_vectors.exists() {
                std::fs::copy(shipped_vectors, index_dir.join(VECTORS_FILE))?;
            }
            log::info!("mirrored packet index into {}", index_dir.display());
            return Ok(());
        }

        self.rebuild_index(payload_dir, &index_file, query_dim).await
    }

    /// The payload's own `faiss/index.faiss`, if its manifest's embedding
    /// spec matches the query-time embedder.
    fn shipped_index_if_compatible(&self, payload_dir: &Path, query_dim: usize) -> Option<PathBuf> {
        let shipped = payload_dir.join(INDEX_FILE);
        if !shipped.exists() || !payload_dir.join(VECTORS_FILE).exists() {
            return None;
        }
        let manifest: PacketManifest =
            serde_json::from_str(&std::fs::read_to_string(payload_dir.join(MANIFEST_FILE)).ok()?)
                .ok()?;
        let spec = &manifest.embedding;
        if spec.model == self.embedder.model()
            && spec.normalized
            && spec.dim as usize == query_dim
        {
            Some(shipped)
        } else {
            None
        }
    }

    async fn rebuild_index(
        &self,
        payload_dir: &Path,
        index_file: &Path,
        query_dim: usize,
    ) -> Result<()> {
        let docs_path = payload_dir.join(DOCS_FILE);
        if !docs_path.exists() {
            return Err(RetrievalError::MissingPacket(format!(
                "{} (cannot rebuild an index without chunks)",
                docs_path.display()
            )));
        }
        let chunks = cpm_packet::read_docs_jsonl(&docs_path)?;
        if chunks.is_empty() {
            return Err(RetrievalError::NoIndex("packet has zero chunks".to_string()));
        }

        log::info!(
            "rebuilding index for {} chunks at {}",
            chunks.len(),
            index_file.display()
        );
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let matrix = self
            .embedder
            .embed_batch(&texts, &EmbedHints::default())
            .await?;
        if matrix.dim != query_dim {
            return Err(RetrievalError::NoIndex(format!(
                "rebuild produced dim {} but query embedder emits {query_dim}",
                matrix.dim
            )));
        }

        let mut rows = matrix.rows;
        for row in &mut rows {
            cpm_packet::normalize_in_place(row);
        }
        let index = FlatIpIndex::from_rows(matrix.dim, rows)?;
        index.save(index_file)?;
        Ok(())
    }

    /// Search the index and collate hits with lazily-loaded document text.
    /// Ordering: descending score, equal scores by ascending chunk id.
    fn search_collated(
        &self,
        payload_dir: &Path,
        index_file: &Path,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<QueryHit>> {
        let index = FlatIpIndex::load(index_file)?;
        let docs = DocsIndex::scan(&payload_dir.join(DOCS_FILE))?;
        if docs.len() != index.len() {
            return Err(RetrievalError::NoIndex(format!(
                "index rows {} disagree with docs {}",
                index.len(),
                docs.len()
            )));
        }

        let hits = index.search_labeled(query_vector, k, docs.ids())?;
        let mut results = Vec::with_capacity(hits.len());
        for (row, score) in hits {
            let chunk = docs.load_row(row)?;
            results.push(QueryHit {
                score,
                path: chunk
                    .meta_str("path")
                    .map(ToString::to_string)
                    .unwrap_or_else(|| chunk.id.clone()),
                start: chunk.meta_int("line_start"),
                end: chunk.meta_int("line_end"),
                snippet: snippet_of(&chunk.text),
            });
        }
        Ok(results)
    }
}

fn snippet_of(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SNIPPET_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SNIPPET_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}
