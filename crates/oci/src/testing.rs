//! Deterministic in-memory registry used by tests (and wired in as a
//! `Registry` variant so the resolver stays backend-agnostic). The handle is
//! cheaply clonable; counters record how many manifest fetches, blob
//! fetches, and payload pulls the resolver actually performed, which is what
//! the metadata-only and single-pull invariants assert against.

use crate::error::{OciError, Result};
use crate::metadata::{PacketMetadata, PACKET_METADATA_MEDIA_TYPE};
use crate::policy::safe_extract_path;
use crate::transport::{Descriptor, ImageManifest, LAYER_TITLE_ANNOTATION, OCI_MANIFEST_MEDIA_TYPE};
use crate::uri::OciRef;
use cpm_packet::sha256_hex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    tags: Mutex<HashMap<String, String>>,
    manifests: Mutex<HashMap<String, ImageManifest>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    referrers: Mutex<HashMap<String, Vec<String>>>,
    resolve_calls: AtomicUsize,
    manifest_fetches: AtomicUsize,
    blob_fetches: AtomicUsize,
    payload_pulls: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    inner: Arc<Inner>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tag_key(reference: &OciRef) -> String {
        format!(
            "{}/{}:{}",
            reference.host,
            reference.repository,
            reference.reference.as_str()
        )
    }

    fn lookup_digest(&self, reference: &OciRef) -> Result<String> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.to_string());
        }
        self.inner
            .tags
            .lock()
            .unwrap()
            .get(&Self::tag_key(reference))
            .cloned()
            .ok_or_else(|| OciError::NotFound(reference.to_string()))
    }

    fn store_blob(&self, bytes: Vec<u8>) -> Descriptor {
        let digest = format!("sha256:{}", sha256_hex(&bytes));
        let size = bytes.len() as u64;
        self.inner
            .blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), bytes);
        Descriptor {
            media_type: "application/octet-stream".to_string(),
            digest,
            size: Some(size),
            annotations: None,
        }
    }

    /// Publish a packet: one small metadata blob plus one layer per payload
    /// file. Returns the manifest digest the tag now points at.
    pub fn publish_packet(
        &self,
        reference: &OciRef,
        metadata: &PacketMetadata,
        payload_files: &[(&str, &[u8])],
    ) -> String {
        let metadata_bytes = serde_json::to_vec(metadata).expect("serialize metadata");
        let mut metadata_layer = self.store_blob(metadata_bytes);
        metadata_layer.media_type = PACKET_METADATA_MEDIA_TYPE.to_string();

        let mut layers = vec![metadata_layer];
        for (name, bytes) in payload_files {
            let mut layer = self.store_blob(bytes.to_vec());
            let mut annotations = BTreeMap::new();
            annotations.insert(LAYER_TITLE_ANNOTATION.to_string(), (*name).to_string());
            layer.annotations = Some(annotations);
            layers.push(layer);
        }

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config: None,
            layers,
        };
        let manifest_bytes = serde_json::to_vec(&manifest).expect("serialize manifest");
        let digest = format!("sha256:{}", sha256_hex(&manifest_bytes));

        self.inner
            .manifests
            .lock()
            .unwrap()
            .insert(digest.clone(), manifest);
        self.inner
            .tags
            .lock()
            .unwrap()
            .insert(Self::tag_key(reference), digest.clone());
        digest
    }

    pub fn add_referrer(&self, digest: &str, artifact_type: &str) {
        self.inner
            .referrers
            .lock()
            .unwrap()
            .entry(digest.to_string())
            .or_default()
            .push(artifact_type.to_string());
    }

    pub fn resolve_digest(&self, reference: &OciRef) -> Result<String> {
        self.inner.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup_digest(reference)
    }

    pub fn fetch_manifest(&self, reference: &OciRef) -> Result<ImageManifest> {
        self.inner.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let digest = self.lookup_digest(reference)?;
        self.inner
            .manifests
            .lock()
            .unwrap()
            .get(&digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(reference.to_string()))
    }

    pub fn fetch_blob(&self, reference: &OciRef, digest: &str) -> Result<Vec<u8>> {
        self.inner.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .inner
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(format!("{reference} blob {digest}")))?;
        let actual = format!("sha256:{}", sha256_hex(&bytes));
        if actual != digest {
            return Err(OciError::DigestMismatch {
                reference: reference.to_string(),
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    pub fn pull_payload(&self, reference: &OciRef, dest: &Path) -> Result<()> {
        self.inner.payload_pulls.fetch_add(1, Ordering::SeqCst);
        let digest = self.lookup_digest(reference)?;
        let manifest = self
            .inner
            .manifests
            .lock()
            .unwrap()
            .get(&digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(reference.to_string()))?;

        std::fs::create_dir_all(dest)?;
        for layer in &manifest.layers {
            if layer.media_type == PACKET_METADATA_MEDIA_TYPE {
                continue;
            }
            let bytes = self
                .inner
                .blobs
                .lock()
                .unwrap()
                .get(&layer.digest)
                .cloned()
                .ok_or_else(|| OciError::NotFound(format!("{reference} blob {}", layer.digest)))?;
            let name = layer
                .title()
                .map(ToString::to_string)
                .unwrap_or_else(|| layer.digest.replace(':', "_"));
            let target = safe_extract_path(dest, &name)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, bytes)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn list_referrer_types(&self, reference: &OciRef) -> Vec<String> {
        reference
            .digest()
            .and_then(|digest| self.inner.referrers.lock().unwrap().get(digest).cloned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn resolve_calls(&self) -> usize {
        self.inner.resolve_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn manifest_fetches(&self) -> usize {
        self.inner.manifest_fetches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn blob_fetches(&self) -> usize {
        self.inner.blob_fetches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn payload_pulls(&self) -> usize {
        self.inner.payload_pulls.load(Ordering::SeqCst)
    }
}

/// Minimal valid metadata for tests.
#[must_use]
pub fn sample_metadata(name: &str, version: &str) -> PacketMetadata {
    use crate::metadata::{PacketDescriptor, PayloadDescriptor, PayloadFile};
    PacketMetadata {
        schema: crate::metadata::PACKET_METADATA_SCHEMA.to_string(),
        schema_version: crate::metadata::PACKET_METADATA_SCHEMA_VERSION.to_string(),
        packet: PacketDescriptor {
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            tags: vec!["cpm".to_string()],
            kind: Some("context".to_string()),
            entrypoints: vec!["query".to_string()],
            capabilities: vec![],
        },
        compat: None,
        payload: PayloadDescriptor {
            files: vec![PayloadFile {
                name: "docs.jsonl".to_string(),
                digest: None,
                size: Some(320),
            }],
            full_ref: None,
        },
        source: None,
    }
}
