//! `cpm.packet.metadata` v1.0 schema plus read-only normalization of the
//! legacy `cpm-oci/v1` shape.

use crate::error::{OciError, Result};
use serde::{Deserialize, Serialize};

pub const PACKET_METADATA_SCHEMA: &str = "cpm.packet.metadata";
pub const PACKET_METADATA_SCHEMA_VERSION: &str = "1.0";
pub const PACKET_METADATA_MEDIA_TYPE: &str = "application/vnd.cpm.packet.manifest.v1+json";
pub const LEGACY_SCHEMA: &str = "cpm-oci/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketMetadata {
    pub schema: String,
    pub schema_version: String,
    pub packet: PacketDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<CompatDescriptor>,
    pub payload: PayloadDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpm_min_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    #[serde(default)]
    pub files: Vec<PayloadFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    #[serde(default)]
    pub minimal: bool,
    #[serde(default)]
    pub include_docs: bool,
    #[serde(default)]
    pub include_embeddings: bool,
}

impl PacketMetadata {
    pub fn validate(&self) -> Result<()> {
        if self.schema != PACKET_METADATA_SCHEMA {
            return Err(OciError::MetadataMissing(format!(
                "invalid metadata schema '{}'",
                self.schema
            )));
        }
        if self.schema_version != PACKET_METADATA_SCHEMA_VERSION {
            return Err(OciError::MetadataMissing(format!(
                "unsupported metadata schema_version '{}'",
                self.schema_version
            )));
        }
        if self.packet.name.trim().is_empty() {
            return Err(OciError::MetadataMissing("packet.name is required".into()));
        }
        if self.packet.version.trim().is_empty() {
            return Err(OciError::MetadataMissing(
                "packet.version is required".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a metadata blob: v1.0 schema first, then the legacy `cpm-oci/v1`
/// shape normalized into v1.0.
pub fn parse_metadata_blob(bytes: &[u8]) -> Result<PacketMetadata> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|err| OciError::MetadataMissing(format!("metadata blob is not JSON: {err}")))?;

    let schema = value.get("schema").and_then(|v| v.as_str()).unwrap_or("");
    if schema == PACKET_METADATA_SCHEMA {
        let metadata: PacketMetadata = serde_json::from_value(value)?;
        metadata.validate()?;
        return Ok(metadata);
    }
    if schema == LEGACY_SCHEMA {
        return normalize_legacy(&value);
    }
    Err(OciError::MetadataMissing(format!(
        "unrecognized metadata schema '{schema}'"
    )))
}

/// Legacy `cpm-oci/v1` blobs carried a flat `{schema, name, version, tags,
/// entrypoints, files}` shape; read-only normalization into the v1.0 form.
fn normalize_legacy(value: &serde_json::Value) -> Result<PacketMetadata> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let version = value
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if name.is_empty() || version.is_empty() {
        return Err(OciError::MetadataMissing(
            "legacy metadata missing name/version".into(),
        ));
    }

    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let files = value
        .get("files")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str().map(|name| PayloadFile {
                        name: name.to_string(),
                        digest: None,
                        size: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let metadata = PacketMetadata {
        schema: PACKET_METADATA_SCHEMA.to_string(),
        schema_version: PACKET_METADATA_SCHEMA_VERSION.to_string(),
        packet: PacketDescriptor {
            name,
            version,
            description: value
                .get("description")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            tags: string_list("tags"),
            kind: value
                .get("kind")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            entrypoints: string_list("entrypoints"),
            capabilities: string_list("capabilities"),
        },
        compat: None,
        payload: PayloadDescriptor {
            files,
            full_ref: value
                .get("full_ref")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
        },
        source: None,
    };
    metadata.validate()?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_v1_metadata() {
        let blob = json!({
            "schema": "cpm.packet.metadata",
            "schema_version": "1.0",
            "packet": {"name": "demo", "version": "1.0.0", "entrypoints": ["query"]},
            "payload": {"files": [{"name": "docs.jsonl", "size": 320}]}
        });
        let metadata = parse_metadata_blob(blob.to_string().as_bytes()).unwrap();
        assert_eq!(metadata.packet.name, "demo");
        assert_eq!(metadata.payload.files[0].name, "docs.jsonl");
    }

    #[test]
    fn normalizes_legacy_shape() {
        let blob = json!({
            "schema": "cpm-oci/v1",
            "name": "old-pack",
            "version": "0.9.0",
            "tags": ["docs"],
            "files": ["docs.jsonl", "manifest.json"]
        });
        let metadata = parse_metadata_blob(blob.to_string().as_bytes()).unwrap();
        assert_eq!(metadata.schema, PACKET_METADATA_SCHEMA);
        assert_eq!(metadata.packet.name, "old-pack");
        assert_eq!(metadata.payload.files.len(), 2);
    }

    #[test]
    fn rejects_unknown_schema_and_missing_fields() {
        assert!(parse_metadata_blob(b"{\"schema\": \"other\"}").is_err());
        let missing = json!({
            "schema": "cpm.packet.metadata",
            "schema_version": "1.0",
            "packet": {"name": "", "version": "1"},
            "payload": {"files": []}
        });
        assert!(parse_metadata_blob(missing.to_string().as_bytes()).is_err());
    }
}
