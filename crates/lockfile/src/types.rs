use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const LOCKFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(rename = "lockfileVersion")]
    pub lockfile_version: u32,
    pub packet: PacketSection,
    pub inputs: InputsSection,
    pub pipeline: Vec<PipelineStep>,
    pub models: Vec<ModelEntry>,
    pub artifacts: ArtifactsSection,
    pub resolution: ResolutionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketSection {
    pub name: String,
    pub version: String,
    pub packet_id: String,
    pub resolved_packet_id: String,
    pub build_profile: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputsSection {
    /// Domain-separated fold over the tuple-sorted `(relpath, sha256)` list.
    pub tree_hash: String,
    pub file_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// One of `build`, `embed`, `index`.
    pub step: String,
    pub plugin: String,
    pub plugin_version: String,
    /// SHA-256 of the canonical JSON of the resolved params.
    pub config_hash: String,
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_deterministic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub provider: String,
    pub model: String,
    pub revision: Option<String>,
    pub dtype: String,
    pub device_policy: String,
    pub normalize: bool,
    pub max_seq_length: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub non_deterministic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsSection {
    pub chunks_manifest_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_hash: Option<String>,
    pub packet_manifest_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSection {
    pub generated_at: String,
    pub cpm_version: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfile_version_key_uses_camel_case() {
        let lockfile = Lockfile {
            lockfile_version: LOCKFILE_VERSION,
            packet: PacketSection {
                name: "demo".into(),
                version: "1.0.0".into(),
                packet_id: "id".into(),
                resolved_packet_id: "rid".into(),
                build_profile: "default".into(),
            },
            inputs: InputsSection {
                tree_hash: "t".into(),
                file_hashes: BTreeMap::new(),
            },
            pipeline: vec![],
            models: vec![],
            artifacts: ArtifactsSection::default(),
            resolution: ResolutionSection {
                generated_at: "2024-01-01T00:00:00Z".into(),
                cpm_version: "0.4.0".into(),
                warnings: vec![],
            },
        };
        let json = serde_json::to_string(&lockfile).unwrap();
        assert!(json.contains("\"lockfileVersion\":1"));

        let back: Lockfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lockfile);
    }

    #[test]
    fn non_deterministic_marker_is_omitted_when_false() {
        let step = PipelineStep {
            step: "build".into(),
            plugin: "cpm:builtin-builder".into(),
            plugin_version: "0.4.0".into(),
            config_hash: "c".into(),
            params: serde_json::json!({}),
            non_deterministic: false,
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(!json.contains("non_deterministic"));

        let marked = PipelineStep {
            non_deterministic: true,
            ..step
        };
        let json = serde_json::to_string(&marked).unwrap();
        assert!(json.contains("\"non_deterministic\":true"));
    }
}
