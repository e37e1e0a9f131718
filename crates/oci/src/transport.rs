//! Registry transport: the OCI image-manifest/blob surface the resolver
//! consumes, with an HTTP implementation and an in-memory one for tests.

use crate::error::Result;
use crate::http::HttpRegistry;
use crate::testing::InMemoryRegistry;
use crate::uri::OciRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const LAYER_TAR_GZ_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const LAYER_TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|map| map.get(LAYER_TITLE_ANNOTATION))
            .map(String::as_str)
    }
}

/// The registry backend. Like the embedding client, this is an enum with a
/// production transport and a deterministic in-memory one; everything above
/// it is backend-agnostic.
pub enum Registry {
    Http(HttpRegistry),
    InMemory(InMemoryRegistry),
}

impl Registry {
    /// Resolve a tag/semver alias to a digest (one round-trip). Pinned refs
    /// short-circuit in the resolver and never reach here.
    pub async fn resolve_digest(&self, reference: &OciRef) -> Result<String> {
        match self {
            Self::Http(http) => http.resolve_digest(reference).await,
            Self::InMemory(fake) => fake.resolve_digest(reference),
        }
    }

    pub async fn fetch_manifest(&self, reference: &OciRef) -> Result<ImageManifest> {
        match self {
            Self::Http(http) => http.fetch_manifest(reference).await,
            Self::InMemory(fake) => fake.fetch_manifest(reference),
        }
    }

    /// Fetch one blob by digest; implementations verify the content hash.
    pub async fn fetch_blob(&self, reference: &OciRef, digest: &str) -> Result<Vec<u8>> {
        match self {
            Self::Http(http) => http.fetch_blob(reference, digest).await,
            Self::InMemory(fake) => fake.fetch_blob(reference, digest),
        }
    }

    /// Materialize every payload layer of the artifact into `dest`.
    pub async fn pull_payload(&self, reference: &OciRef, dest: &Path) -> Result<()> {
        match self {
            Self::Http(http) => http.pull_payload(reference, dest).await,
            Self::InMemory(fake) => fake.pull_payload(reference, dest),
        }
    }

    /// Artifact types of referrers attached to a digest (signatures, SBOMs,
    /// provenance). Used by the trust policy.
    pub async fn list_referrer_types(&self, reference: &OciRef) -> Result<Vec<String>> {
        match self {
            Self::Http(http) => http.list_referrer_types(reference).await,
            Self::InMemory(fake) => Ok(fake.list_referrer_types(reference)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_title_reads_oci_annotation() {
        let mut annotations = BTreeMap::new();
        annotations.insert(LAYER_TITLE_ANNOTATION.to_string(), "docs.jsonl".to_string());
        let descriptor = Descriptor {
            media_type: "application/octet-stream".to_string(),
            digest: "sha256:abc".to_string(),
            size: Some(3),
            annotations: Some(annotations),
        };
        assert_eq!(descriptor.title(), Some("docs.jsonl"));
    }

    #[test]
    fn image_manifest_uses_wire_field_names() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config: None,
            layers: vec![],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"schemaVersion\":2"));
        assert!(json.contains("\"mediaType\""));
    }
}
