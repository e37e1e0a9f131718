use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One addressable text segment of a packet.
///
/// The `id` is `<relpath>:<counter>` with a per-file counter starting at 0,
/// so ids stay stable when unrelated files are added or removed. `hash` is
/// the SHA-256 hex of `text` and is the reuse key for incremental builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    pub id: String,
    pub text: String,
    pub hash: String,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl DocChunk {
    pub fn new(id: String, text: String, hash: String) -> Self {
        Self {
            id,
            text,
            hash,
            metadata: BTreeMap::new(),
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(MetaValue::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn meta_int(&self, key: &str) -> Option<i64> {
        match self.metadata.get(key) {
            Some(MetaValue::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Scalar metadata value. Chunk metadata is a flat key → scalar map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetaValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Storage dtype of persisted vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorDtype {
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

/// Description of the embedding model that produced a packet's vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    pub provider: String,
    pub model: String,
    pub dim: u32,
    pub dtype: VectorDtype,
    pub normalized: bool,
    pub max_seq_length: Option<u32>,
}

impl EmbeddingSpec {
    /// Disambiguates indexes built by different embedders over the same
    /// packet: `sha256(model <US> dim <US> normalized)` truncated to 16 hex
    /// chars.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let raw = format!("{}\u{1f}{}\u{1f}{}", self.model, self.dim, self.normalized);
        let hex = crate::hashing::sha256_hex(raw.as_bytes());
        hex[..16].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityInfo {
    pub space: String,
    pub index_type: String,
}

impl Default for SimilarityInfo {
    fn default() -> Self {
        Self {
            space: "cosine".to_string(),
            index_type: "flat-ip".to_string(),
        }
    }
}

/// Reference to one file inside the packet directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub format: String,
}

/// File inventory of a packet. `vectors` and `index` are nullable to signal
/// a partial build (chunks written, embedding failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketFiles {
    pub docs: String,
    pub vectors: Option<FileRef>,
    pub index: Option<FileRef>,
    pub calibration: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCounts {
    pub docs: usize,
    pub vectors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub input_dir: String,
    pub file_ext_counts: BTreeMap<String, usize>,
}

/// Identity block mirrored into `cpm.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpmInfo {
    pub name: String,
    pub version: String,
    pub tags: Vec<String>,
    pub entrypoints: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalStats {
    pub enabled: bool,
    pub reused: usize,
    pub embedded: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checksum {
    pub algo: String,
    pub value: String,
}

impl Checksum {
    pub fn sha256(value: String) -> Self {
        Self {
            algo: "sha256".to_string(),
            value,
        }
    }
}

pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";
pub const BUILD_STATUS_EMBEDDING_FAILED: &str = "embedding_failed";
pub const BUILD_STATUS_INDEX_FAILED: &str = "index_write_failed";

/// `manifest.json` of a packet. Serialized as canonical JSON (sorted keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketManifest {
    pub schema_version: String,
    pub packet_id: String,
    pub embedding: EmbeddingSpec,
    pub similarity: SimilarityInfo,
    pub files: PacketFiles,
    pub counts: PacketCounts,
    pub source: SourceInfo,
    pub cpm: CpmInfo,
    pub incremental: IncrementalStats,
    #[serde(default)]
    pub checksums: BTreeMap<String, Checksum>,
    #[serde(default)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl PacketManifest {
    pub fn build_status(&self) -> Option<&str> {
        self.extras.get("build_status").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_model_sensitive() {
        let spec = EmbeddingSpec {
            provider: "openai-compatible".to_string(),
            model: "jina-code-v2".to_string(),
            dim: 768,
            dtype: VectorDtype::F16,
            normalized: true,
            max_seq_length: Some(1024),
        };
        let fp = spec.fingerprint();
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, spec.fingerprint());

        let other = EmbeddingSpec {
            model: "jina-code-v3".to_string(),
            ..spec.clone()
        };
        assert_ne!(fp, other.fingerprint());

        let unnormalized = EmbeddingSpec {
            normalized: false,
            ..spec
        };
        assert_ne!(fp, unnormalized.fingerprint());
    }

    #[test]
    fn meta_value_serializes_as_bare_scalar() {
        let mut chunk = DocChunk::new("a.rs:0".into(), "fn x() {}".into(), "h".into());
        chunk.metadata.insert("path".into(), "a.rs".into());
        chunk.metadata.insert("line_start".into(), 1usize.into());

        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"path\":\"a.rs\""));
        assert!(json.contains("\"line_start\":1"));
    }

    #[test]
    fn manifest_roundtrips_with_null_vectors() {
        let manifest = PacketManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            packet_id: "deadbeef".to_string(),
            embedding: EmbeddingSpec {
                provider: "openai-compatible".to_string(),
                model: "m".to_string(),
                dim: 8,
                dtype: VectorDtype::F16,
                normalized: true,
                max_seq_length: None,
            },
            similarity: SimilarityInfo::default(),
            files: PacketFiles {
                docs: "docs.jsonl".to_string(),
                vectors: None,
                index: None,
                calibration: None,
            },
            counts: PacketCounts {
                docs: 3,
                vectors: 0,
            },
            source: SourceInfo::default(),
            cpm: CpmInfo::default(),
            incremental: IncrementalStats::default(),
            checksums: BTreeMap::new(),
            extras: BTreeMap::new(),
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let back: PacketManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest, back);
        assert!(back.files.vectors.is_none());
    }
}
