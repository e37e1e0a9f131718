//! Shared packet primitives: the on-disk packet format, content hashing, and
//! the flat inner-product index every other CPM crate builds on.

pub mod canonical;
pub mod docs;
pub mod error;
pub mod hashing;
pub mod index;
pub mod paths;
pub mod types;
pub mod vectors;
pub mod yaml;

pub use canonical::{
    canonical_json_sha256, to_canonical_json, to_canonical_json_pretty, write_canonical_json,
};
pub use docs::{read_docs_jsonl, write_docs_jsonl, DocsOffsets, DOCS_FILE};
pub use error::{PacketError, Result};
pub use hashing::{compute_packet_id, fold_sha256, sha256_file, sha256_hex};
pub use index::{FlatIpIndex, INDEX_DIR, INDEX_FILE};
pub use paths::{safe_key, CpmPaths, DEFAULT_CPM_ROOT, PACKET_METADATA_FILE};
pub use types::{
    Checksum, CpmInfo, DocChunk, EmbeddingSpec, FileRef, IncrementalStats, MetaValue,
    PacketCounts, PacketFiles, PacketManifest, SimilarityInfo, SourceInfo, VectorDtype,
    BUILD_STATUS_EMBEDDING_FAILED, BUILD_STATUS_INDEX_FAILED, MANIFEST_SCHEMA_VERSION,
};
pub use vectors::{
    f16_to_f32, f32_to_f16, normalize_in_place, read_vectors_f16, write_vectors_f16, VECTORS_FILE,
};
pub use yaml::{CpmYml, CPM_YML_FILE};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCKFILE_DEFAULT_NAME: &str = "cpm.lock.json";
