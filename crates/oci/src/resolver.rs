//! Source resolution: metadata-first lookup and lazy digest-keyed fetch.

use crate::cas::{
    acquire_digest_lock, create_staging_dir, discard_staging, publish_staged_payload,
    validate_staged_payload,
};
use crate::error::{OciError, Result};
use crate::metadata::{parse_metadata_blob, PacketMetadata, PACKET_METADATA_MEDIA_TYPE};
use crate::policy::OciPolicy;
use crate::transport::Registry;
use crate::uri::OciRef;
use cpm_packet::CpmPaths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_ALIAS_TTL: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLookup {
    pub digest: String,
    pub pinned_uri: String,
    pub metadata: PacketMetadata,
    /// True when the metadata came from the digest-keyed cache without any
    /// network traffic.
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalPacketDir {
    pub digest: String,
    pub payload_dir: PathBuf,
    pub cache_hit: bool,
}

#[derive(Serialize, Deserialize)]
struct AliasCacheEntry {
    digest: String,
    expires_at: u64,
}

pub struct SourceResolver {
    paths: CpmPaths,
    registry: Registry,
    policy: OciPolicy,
    /// `None` disables the alias cache entirely.
    alias_ttl: Option<Duration>,
}

impl SourceResolver {
    pub fn new(paths: CpmPaths, registry: Registry, policy: OciPolicy) -> Self {
        Self {
            paths,
            registry,
            policy,
            alias_ttl: Some(DEFAULT_ALIAS_TTL),
        }
    }

    #[must_use]
    pub fn with_alias_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.alias_ttl = ttl.filter(|ttl| !ttl.is_zero());
        self
    }

    #[must_use]
    pub fn paths(&self) -> &CpmPaths {
        &self.paths
    }

    /// Alias → digest, using the TTL cache when enabled. Pinned refs never
    /// touch the network.
    pub async fn resolve_digest(&self, reference: &OciRef) -> Result<String> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.to_string());
        }
        self.policy.check_host(reference)?;

        if let Some(entry) = self.read_alias_cache(reference) {
            return Ok(entry);
        }
        let digest = self.registry.resolve_digest(reference).await?;
        self.write_alias_cache(reference, &digest);
        Ok(digest)
    }

    /// Metadata-only lookup: exactly one manifest fetch plus one blob fetch
    /// on a fresh digest; digest-keyed entries are reused across processes.
    pub async fn lookup_metadata(&self, reference: &OciRef) -> Result<ResolvedLookup> {
        self.policy.check_host(reference)?;
        let digest = self.resolve_digest(reference).await?;
        let pinned_uri = reference.pinned_uri(&digest);

        let cache_path = self.paths.metadata_cache_path(&digest);
        if let Some(metadata) = read_json::<PacketMetadata>(&cache_path) {
            return Ok(ResolvedLookup {
                digest,
                pinned_uri,
                metadata,
                cache_hit: true,
            });
        }

        let pinned = reference.pinned(&digest);
        let manifest = self.registry.fetch_manifest(&pinned).await?;

        // Metadata layer selection: the v1 media type first, then legacy
        // blobs smallest-first, then give up.
        let mut candidates: Vec<&crate::transport::Descriptor> = manifest
            .layers
            .iter()
            .filter(|layer| layer.media_type == PACKET_METADATA_MEDIA_TYPE)
            .collect();
        if candidates.is_empty() {
            candidates = manifest.layers.iter().collect();
            candidates.sort_by_key(|layer| layer.size.unwrap_or(u64::MAX));
        }

        let mut metadata: Option<PacketMetadata> = None;
        for layer in candidates {
            let blob = self.registry.fetch_blob(&pinned, &layer.digest).await?;
            match parse_metadata_blob(&blob) {
                Ok(parsed) => {
                    metadata = Some(parsed);
                    break;
                }
                Err(err) => {
                    if layer.media_type == PACKET_METADATA_MEDIA_TYPE {
                        return Err(err);
                    }
                    log::debug!("layer {} is not packet metadata: {err}", layer.digest);
                }
            }
        }
        let metadata = metadata.ok_or_else(|| {
            OciError::MetadataMissing(format!("no metadata layer found for {reference}"))
        })?;

        write_json_atomic(&cache_path, &metadata)?;
        Ok(ResolvedLookup {
            digest,
            pinned_uri,
            metadata,
            cache_hit: false,
        })
    }

    /// Lazy full fetch: cache short-circuit, per-digest single writer,
    /// staged pull, validation, atomic publish.
    pub async fn resolve_and_fetch(&self, reference: &OciRef) -> Result<LocalPacketDir> {
        self.policy.check_host(reference)?;
        let digest = self.resolve_digest(reference).await?;
        let payload_dir = self.paths.cas_payload_dir(&digest);

        if payload_is_complete(&payload_dir) {
            return Ok(LocalPacketDir {
                digest,
                payload_dir,
                cache_hit: true,
            });
        }

        let _lock = acquire_digest_lock(self.paths.cas_lock_path(&digest)).await?;
        if payload_is_complete(&payload_dir) {
            // Another writer materialized it while this one waited.
            return Ok(LocalPacketDir {
                digest,
                payload_dir,
                cache_hit: true,
            });
        }

        let pinned = reference.pinned(&digest);
        let referrer_types = self.registry.list_referrer_types(&pinned).await?;
        self.policy.verify_trust(&pinned, &referrer_types)?;

        let staging = create_staging_dir(self.paths.root(), &digest)?;
        let pulled = self.registry.pull_payload(&pinned, &staging).await;
        if let Err(err) = pulled {
            discard_staging(&staging);
            return Err(err);
        }
        if let Err(err) = validate_staged_payload(&staging) {
            discard_staging(&staging);
            return Err(err);
        }

        publish_staged_payload(&staging, &payload_dir)?;
        self.write_normalized_metadata(&digest, &payload_dir)?;

        Ok(LocalPacketDir {
            digest,
            payload_dir,
            cache_hit: false,
        })
    }

    /// Normalized metadata copy at `meta/<digest>/packet.manifest.json`,
    /// derived from the shipped metadata file or the packet manifest.
    fn write_normalized_metadata(&self, digest: &str, payload_dir: &Path) -> Result<()> {
        let meta_path = self.paths.meta_path(digest);
        let shipped = payload_dir.join(cpm_packet::PACKET_METADATA_FILE);
        if shipped.exists() {
            if let Some(metadata) = read_json::<PacketMetadata>(&shipped) {
                write_json_atomic(&meta_path, &metadata)?;
                return Ok(());
            }
        }

        let manifest_path = payload_dir.join(cpm_packet::MANIFEST_FILE);
        let Some(manifest) = read_json::<cpm_packet::PacketManifest>(&manifest_path) else {
            log::warn!(
                "no normalizable metadata in payload for {digest}; skipping meta copy"
            );
            return Ok(());
        };
        let normalized = crate::metadata::PacketMetadata {
            schema: crate::metadata::PACKET_METADATA_SCHEMA.to_string(),
            schema_version: crate::metadata::PACKET_METADATA_SCHEMA_VERSION.to_string(),
            packet: crate::metadata::PacketDescriptor {
                name: manifest.cpm.name.clone(),
                version: manifest.cpm.version.clone(),
                description: None,
                tags: manifest.cpm.tags.clone(),
                kind: None,
                entrypoints: manifest.cpm.entrypoints.clone(),
                capabilities: vec![],
            },
            compat: None,
            payload: crate::metadata::PayloadDescriptor::default(),
            source: None,
        };
        write_json_atomic(&meta_path, &normalized)?;
        Ok(())
    }

    fn read_alias_cache(&self, reference: &OciRef) -> Option<String> {
        self.alias_ttl?;
        let path = self.paths.alias_cache_path(&reference.alias_hash());
        let entry: AliasCacheEntry = read_json(&path)?;
        if entry.expires_at <= unix_now() {
            return None;
        }
        Some(entry.digest)
    }

    fn write_alias_cache(&self, reference: &OciRef, digest: &str) {
        let Some(ttl) = self.alias_ttl else {
            return;
        };
        let path = self.paths.alias_cache_path(&reference.alias_hash());
        let entry = AliasCacheEntry {
            digest: digest.to_string(),
            expires_at: unix_now() + ttl.as_secs(),
        };
        if let Err(err) = write_json_atomic(&path, &entry) {
            log::warn!("failed to write alias cache {}: {err}", path.display());
        }
    }
}

fn payload_is_complete(payload_dir: &Path) -> bool {
    payload_dir.join(cpm_packet::MANIFEST_FILE).exists()
        || payload_dir.join(cpm_packet::PACKET_METADATA_FILE).exists()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    cpm_packet::write_canonical_json(path, value)?;
    Ok(())
}
