//! Packet assembly: scan → chunk → incremental embed → index → persist.

use crate::archive::{archive_packet_dir, ArchiveFormat};
use crate::clock::Clock;
use crate::error::{BuildError, Result};
use crate::incremental::{try_load_prior, PriorVectors};
use crate::scan::{infer_tags, posix_path, scan_source_tree, SourceFile};
use cpm_chunker::{chunk_file, ChunkConfig};
use cpm_embeddings::{EmbedHints, EmbeddingClient};
use cpm_packet::{
    sha256_file, write_canonical_json, write_docs_jsonl, write_vectors_f16, Checksum, CpmInfo,
    CpmYml, DocChunk, EmbeddingSpec, FileRef, FlatIpIndex, IncrementalStats, PacketCounts,
    PacketFiles, PacketManifest, SimilarityInfo, SourceInfo, VectorDtype,
    BUILD_STATUS_EMBEDDING_FAILED, BUILD_STATUS_INDEX_FAILED, CPM_YML_FILE, DOCS_FILE, INDEX_FILE,
    MANIFEST_FILE, MANIFEST_SCHEMA_VERSION, VECTORS_FILE,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const BUILDING_SENTINEL: &str = ".building";
const BUILD_STATUS_CHUNKS_WRITTEN: &str = "chunks_written";

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Packet name; defaults to the destination directory name.
    pub name: Option<String>,
    pub version: String,
    pub build_profile: String,
    pub description: Option<String>,
    pub entrypoints: Vec<String>,
    pub chunk: ChunkConfig,
    /// When set, the embedder's output dimension must match.
    pub expected_dim: Option<u32>,
    pub provider: String,
    pub archive: Option<ArchiveFormat>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: None,
            version: "0.0.0".to_string(),
            build_profile: "default".to_string(),
            description: None,
            entrypoints: vec!["query".to_string()],
            chunk: ChunkConfig::default(),
            expected_dim: None,
            provider: "openai-compatible".to_string(),
            archive: None,
        }
    }
}

/// Serializable subset of the configuration that participates in
/// `config_hash` (and therefore in `packet_id`).
#[derive(Serialize)]
struct ConfigFingerprint<'a> {
    chunk: &'a ChunkConfig,
    model: &'a str,
    max_seq_length: Option<u32>,
    expected_dim: Option<u32>,
}

pub fn config_hash(config: &BuildConfig, model: &str, max_seq_length: Option<u32>) -> String {
    let fingerprint = ConfigFingerprint {
        chunk: &config.chunk,
        model,
        max_seq_length,
        expected_dim: config.expected_dim,
    };
    cpm_packet::canonical_json_sha256(&fingerprint).unwrap_or_default()
}

pub use cpm_packet::compute_packet_id;

/// Refuses to start while another builder holds the destination; removed on
/// drop so error paths do not wedge the next invocation.
struct BuildingSentinel {
    path: PathBuf,
}

impl BuildingSentinel {
    fn acquire(dest: &Path) -> Result<Self> {
        std::fs::create_dir_all(dest)?;
        let path = dest.join(BUILDING_SENTINEL);
        if path.exists() {
            return Err(BuildError::DestinationBusy(path.display().to_string()));
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for BuildingSentinel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Full build from a source tree.
pub async fn build(
    source: &Path,
    dest: &Path,
    config: &BuildConfig,
    embedder: &EmbeddingClient,
    clock: &dyn Clock,
) -> Result<PacketManifest> {
    let scanned = scan_source_tree(source)?;
    if scanned.files.is_empty() {
        return Err(BuildError::NoInputs(source.display().to_string()));
    }

    let chunks = chunk_files(&scanned.files, &config.chunk)?;
    let source_info = SourceInfo {
        input_dir: posix_path(source),
        file_ext_counts: scanned.ext_counts,
    };
    finish_build(dest, config, embedder, clock, chunks, source_info).await
}

/// Resume embedding from an existing `docs.jsonl` (the `embed`
/// sub-operation after an earlier `embedding_failed` build).
pub async fn embed_from_existing_chunks(
    dest: &Path,
    config: &BuildConfig,
    embedder: &EmbeddingClient,
    clock: &dyn Clock,
) -> Result<PacketManifest> {
    let docs_path = dest.join(DOCS_FILE);
    if !docs_path.exists() {
        return Err(BuildError::Config(format!(
            "no {DOCS_FILE} in {}; run a full build first",
            dest.display()
        )));
    }
    let chunks = cpm_packet::read_docs_jsonl(&docs_path)?;
    if chunks.is_empty() {
        return Err(BuildError::NoInputs(dest.display().to_string()));
    }

    // Recover source info from the tentative manifest when present.
    let source_info = std::fs::read_to_string(dest.join(MANIFEST_FILE))
        .ok()
        .and_then(|raw| serde_json::from_str::<PacketManifest>(&raw).ok())
        .map(|manifest| manifest.source)
        .unwrap_or_default();

    finish_build(dest, config, embedder, clock, chunks, source_info).await
}

fn chunk_files(files: &[SourceFile], chunk_config: &ChunkConfig) -> Result<Vec<DocChunk>> {
    let mut chunks = Vec::new();
    for file in files {
        let file_chunks = chunk_file(&file.text, &file.rel_path, &file.ext, chunk_config)
            .map_err(|source| BuildError::Chunking {
                path: file.rel_path.clone(),
                source,
            })?;
        chunks.extend(file_chunks);
    }
    Ok(chunks)
}

async fn finish_build(
    dest: &Path,
    config: &BuildConfig,
    embedder: &EmbeddingClient,
    clock: &dyn Clock,
    chunks: Vec<DocChunk>,
    source_info: SourceInfo,
) -> Result<PacketManifest> {
    let _sentinel = BuildingSentinel::acquire(dest)?;
    std::fs::create_dir_all(dest.join("faiss"))?;

    let name = config
        .name
        .clone()
        .or_else(|| {
            dest.file_name()
                .and_then(|n| n.to_str())
                .map(ToString::to_string)
        })
        .ok_or_else(|| BuildError::Config("packet name could not be determined".to_string()))?;
    let tags = infer_tags(&source_info.file_ext_counts);
    let cfg_hash = config_hash(config, embedder.model(), embedder.max_seq_length());
    let packet_id = compute_packet_id(
        &name,
        &config.version,
        &config.build_profile,
        &source_info.input_dir,
        &cfg_hash,
    );

    // The prior state must be read before docs.jsonl is overwritten.
    let prior = try_load_prior(dest, embedder.model(), embedder.max_seq_length())?;
    log::info!(
        "build {name}: {} chunks, incremental cache {}",
        chunks.len(),
        if prior.is_some() { "enabled" } else { "disabled" }
    );

    write_docs_jsonl(&dest.join(DOCS_FILE), &chunks)?;

    let mut manifest = manifest_skeleton(
        &packet_id,
        config,
        &name,
        &tags,
        embedder,
        0,
        source_info.clone(),
        IncrementalStats::default(),
    );
    manifest.counts.docs = chunks.len();
    manifest.extras.insert(
        "build_status".to_string(),
        serde_json::Value::String(BUILD_STATUS_CHUNKS_WRITTEN.to_string()),
    );
    write_canonical_json(&dest.join(MANIFEST_FILE), &manifest)?;

    let outcome = match embed_all(&chunks, prior.as_ref(), config, embedder).await {
        Ok(outcome) => outcome,
        Err(EmbedOutcomeError::Unavailable(detail)) => {
            manifest.extras.insert(
                "build_status".to_string(),
                serde_json::Value::String(BUILD_STATUS_EMBEDDING_FAILED.to_string()),
            );
            manifest.extras.insert(
                "build_error".to_string(),
                serde_json::Value::String(detail.clone()),
            );
            write_canonical_json(&dest.join(MANIFEST_FILE), &manifest)?;
            return Err(BuildError::EmbeddingUnavailable(detail));
        }
        Err(EmbedOutcomeError::Fatal(err)) => return Err(err),
    };

    let dim = outcome.dim;
    let rows = outcome.rows;
    write_vectors_f16(&dest.join(VECTORS_FILE), &rows, dim)?;

    let index_path = dest.join(INDEX_FILE);
    let index_written = match FlatIpIndex::from_rows(dim, rows).and_then(|index| {
        index.save(&index_path)?;
        Ok(())
    }) {
        Ok(()) => true,
        Err(err) => {
            let _ = std::fs::remove_file(&index_path);
            manifest.extras.insert(
                "build_status".to_string(),
                serde_json::Value::String(BUILD_STATUS_INDEX_FAILED.to_string()),
            );
            manifest.extras.insert(
                "build_error".to_string(),
                serde_json::Value::String(err.to_string()),
            );
            write_canonical_json(&dest.join(MANIFEST_FILE), &manifest)?;
            return Err(BuildError::IndexWriteFailed(err.to_string()));
        }
    };

    let created_at = clock.now_rfc3339();
    CpmYml {
        name: name.clone(),
        version: config.version.clone(),
        description: config
            .description
            .clone()
            .unwrap_or_else(|| format!("Auto-built from {}", source_info.input_dir)),
        tags: tags.clone(),
        entrypoints: config.entrypoints.clone(),
        embedding_model: embedder.model().to_string(),
        embedding_dim: dim as u32,
        embedding_normalized: true,
        created_at,
    }
    .write(&dest.join(CPM_YML_FILE))?;

    let mut final_manifest = manifest_skeleton(
        &packet_id,
        config,
        &name,
        &tags,
        embedder,
        dim as u32,
        source_info,
        outcome.stats,
    );
    final_manifest.counts = PacketCounts {
        docs: chunks.len(),
        vectors: chunks.len(),
    };
    final_manifest.files.vectors = Some(FileRef {
        path: VECTORS_FILE.to_string(),
        format: "f16_rowmajor".to_string(),
    });
    if index_written {
        final_manifest.files.index = Some(FileRef {
            path: INDEX_FILE.to_string(),
            format: "flat-ip".to_string(),
        });
    }
    final_manifest.checksums = compute_checksums(dest)?;
    write_canonical_json(&dest.join(MANIFEST_FILE), &final_manifest)?;

    if let Some(format) = config.archive {
        let archive_path = archive_packet_dir(dest, format)?;
        log::info!("archived packet to {}", archive_path.display());
    }

    log::info!(
        "build {name}: reused={} embedded={} removed={}",
        final_manifest.incremental.reused,
        final_manifest.incremental.embedded,
        final_manifest.incremental.removed
    );
    Ok(final_manifest)
}

struct EmbedOutcome {
    dim: usize,
    rows: Vec<Vec<f32>>,
    stats: IncrementalStats,
}

enum EmbedOutcomeError {
    /// Transport-level failure: write the partial manifest, keep the chunks.
    Unavailable(String),
    Fatal(BuildError),
}

impl From<BuildError> for EmbedOutcomeError {
    fn from(err: BuildError) -> Self {
        Self::Fatal(err)
    }
}

async fn embed_all(
    chunks: &[DocChunk],
    prior: Option<&PriorVectors>,
    config: &BuildConfig,
    embedder: &EmbeddingClient,
) -> std::result::Result<EmbedOutcome, EmbedOutcomeError> {
    let hints = EmbedHints {
        dim: config.expected_dim,
        normalize: Some(true),
        ..EmbedHints::default()
    };
    let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();

    let mut reused_rows: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
    let mut missing: Vec<usize> = Vec::new();
    for (idx, hash) in hashes.iter().enumerate() {
        match prior.and_then(|p| p.get(hash)) {
            Some(row) => reused_rows.push(Some(row.clone())),
            None => {
                reused_rows.push(None);
                missing.push(idx);
            }
        }
    }
    let removed = prior.map(|p| p.removed_count(&hashes)).unwrap_or(0);
    let mut reused = chunks.len() - missing.len();
    let mut embedded = missing.len();

    let mut fresh = if missing.is_empty() {
        None
    } else {
        let texts: Vec<String> = missing.iter().map(|&idx| chunks[idx].text.clone()).collect();
        Some(embed_texts(embedder, &texts, &hints).await?)
    };

    // Dimension reconciliation: a reused row set whose dim disagrees with the
    // fresh response invalidates the cache, once.
    let mut dim = match (&fresh, prior) {
        (Some(matrix), _) => matrix.dim,
        (None, Some(prior)) => prior.dim,
        (None, None) => 0,
    };
    let cache_conflict = prior.is_some_and(|p| fresh.as_ref().is_some_and(|m| m.dim != p.dim));
    let config_conflict =
        config.expected_dim.is_some_and(|expected| dim != expected as usize);

    if cache_conflict || (config_conflict && reused > 0) {
        log::warn!("embedding dim mismatch against cached vectors; re-embedding everything");
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let matrix = embed_texts(embedder, &texts, &hints).await?;
        dim = matrix.dim;
        reused = 0;
        embedded = chunks.len();
        reused_rows = vec![None; chunks.len()];
        missing = (0..chunks.len()).collect();
        fresh = Some(matrix);
    }

    if let Some(expected) = config.expected_dim {
        if dim != expected as usize {
            return Err(EmbedOutcomeError::Fatal(BuildError::DimMismatch {
                expected: expected as usize,
                actual: dim,
            }));
        }
    }

    let mut rows: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    let mut fresh_iter = fresh
        .map(|matrix| matrix.rows.into_iter())
        .unwrap_or_else(|| Vec::new().into_iter());
    let mut missing_cursor = missing.iter().peekable();
    for (idx, reusable) in reused_rows.into_iter().enumerate() {
        match reusable {
            Some(row) => rows.push(row),
            None => {
                debug_assert_eq!(missing_cursor.peek().copied(), Some(&idx));
                missing_cursor.next();
                let row = fresh_iter.next().ok_or_else(|| {
                    EmbedOutcomeError::Unavailable("embedding response shorter than request".into())
                })?;
                rows.push(row);
            }
        }
    }

    Ok(EmbedOutcome {
        dim,
        rows,
        stats: IncrementalStats {
            enabled: prior.is_some(),
            reused,
            embedded,
            removed,
        },
    })
}

/// Embed fresh texts. Freshly computed rows are L2-normalized here; reused
/// rows never pass through this function, so their f16 encoding stays
/// bitwise identical to the prior build.
async fn embed_texts(
    embedder: &EmbeddingClient,
    texts: &[String],
    hints: &EmbedHints,
) -> std::result::Result<cpm_embeddings::EmbedMatrix, EmbedOutcomeError> {
    let mut matrix = embedder
        .embed_batch(texts, hints)
        .await
        .map_err(|err| EmbedOutcomeError::Unavailable(err.to_string()))?;
    if !matrix.is_finite() {
        return Err(EmbedOutcomeError::Fatal(BuildError::NonFiniteVector));
    }
    for row in &mut matrix.rows {
        cpm_packet::normalize_in_place(row);
    }
    Ok(matrix)
}

#[allow(clippy::too_many_arguments)]
fn manifest_skeleton(
    packet_id: &str,
    config: &BuildConfig,
    name: &str,
    tags: &[String],
    embedder: &EmbeddingClient,
    dim: u32,
    source: SourceInfo,
    stats: IncrementalStats,
) -> PacketManifest {
    PacketManifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        packet_id: packet_id.to_string(),
        embedding: EmbeddingSpec {
            provider: config.provider.clone(),
            model: embedder.model().to_string(),
            dim,
            dtype: VectorDtype::F16,
            normalized: true,
            max_seq_length: embedder.max_seq_length(),
        },
        similarity: SimilarityInfo::default(),
        files: PacketFiles {
            docs: DOCS_FILE.to_string(),
            vectors: None,
            index: None,
            calibration: None,
        },
        counts: PacketCounts { docs: 0, vectors: 0 },
        source,
        cpm: CpmInfo {
            name: name.to_string(),
            version: config.version.clone(),
            tags: tags.to_vec(),
            entrypoints: config.entrypoints.clone(),
        },
        incremental: stats,
        checksums: BTreeMap::new(),
        extras: BTreeMap::new(),
    }
}

fn compute_checksums(dest: &Path) -> Result<BTreeMap<String, Checksum>> {
    let mut checksums = BTreeMap::new();
    for rel in [CPM_YML_FILE, DOCS_FILE, VECTORS_FILE, INDEX_FILE] {
        let path = dest.join(rel);
        if path.exists() {
            checksums.insert(rel.to_string(), Checksum::sha256(sha256_file(&path)?));
        }
    }
    Ok(checksums)
}
