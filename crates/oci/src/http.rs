//! OCI distribution API transport over reqwest.
//!
//! Paths follow the registry v2 layout: `HEAD/GET /v2/<repo>/manifests/<ref>`
//! and `GET /v2/<repo>/blobs/<digest>`. Digest resolution prefers the
//! `Docker-Content-Digest` response header and falls back to hashing the
//! manifest body. Every fetched blob is re-hashed against its digest.

use crate::error::{OciError, Result};
use crate::policy::{safe_extract_path, OciPolicy};
use crate::transport::{ImageManifest, LAYER_TAR_GZ_MEDIA_TYPE};
use crate::uri::OciRef;
use cpm_packet::sha256_hex;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_OCI_TIMEOUT: Duration = Duration::from_secs(30);
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone)]
pub struct OciClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub token: Option<String>,
    pub max_artifact_size_bytes: Option<u64>,
}

impl Default for OciClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_OCI_TIMEOUT,
            max_retries: 2,
            backoff: Duration::from_millis(200),
            token: None,
            max_artifact_size_bytes: None,
        }
    }
}

pub struct HttpRegistry {
    config: OciClientConfig,
    policy: OciPolicy,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(config: OciClientConfig, policy: OciPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| OciError::UpstreamUnavailable {
                attempts: 0,
                detail: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self {
            config,
            policy,
            client,
        })
    }

    fn base_url(&self, reference: &OciRef) -> String {
        let scheme = self.policy.scheme_for(&reference.host);
        format!("{scheme}://{}/v2/{}", reference.host, reference.repository)
    }

    pub async fn resolve_digest(&self, reference: &OciRef) -> Result<String> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.to_string());
        }
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.reference.as_str()
        );

        let response = self
            .send_with_retry(reference, || {
                self.decorate(self.client.head(&url).header("accept", MANIFEST_ACCEPT))
            })
            .await?;
        if let Some(digest) = header_digest(&response) {
            return Ok(digest);
        }

        // Some registries omit the digest header on HEAD; hash the body.
        let response = self
            .send_with_retry(reference, || {
                self.decorate(self.client.get(&url).header("accept", MANIFEST_ACCEPT))
            })
            .await?;
        if let Some(digest) = header_digest(&response) {
            return Ok(digest);
        }
        let body = response.bytes().await.map_err(|err| transport_error(&err))?;
        Ok(format!("sha256:{}", sha256_hex(&body)))
    }

    pub async fn fetch_manifest(&self, reference: &OciRef) -> Result<ImageManifest> {
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.reference.as_str()
        );
        let response = self
            .send_with_retry(reference, || {
                self.decorate(self.client.get(&url).header("accept", MANIFEST_ACCEPT))
            })
            .await?;
        let body = response.bytes().await.map_err(|err| transport_error(&err))?;

        // The manifest is the trust anchor for every layer that follows; a
        // digest-pinned fetch must get back exactly the pinned bytes, not
        // whatever the registry happens to serve under that URL.
        if let Some(expected) = reference.digest() {
            verify_body_digest(reference, expected, &body)?;
        }
        serde_json::from_slice(&body)
            .map_err(|err| OciError::MetadataMissing(format!("unparseable image manifest: {err}")))
    }

    pub async fn fetch_blob(&self, reference: &OciRef, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{digest}", self.base_url(reference));
        let response = self
            .send_with_retry(reference, || self.decorate(self.client.get(&url)))
            .await?;
        let body = response.bytes().await.map_err(|err| transport_error(&err))?;

        verify_body_digest(reference, digest, &body)?;
        if let Some(limit) = self.config.max_artifact_size_bytes {
            if body.len() as u64 > limit {
                return Err(OciError::PolicyDenied(format!(
                    "blob {digest} exceeds size limit {limit} bytes"
                )));
            }
        }
        Ok(body.to_vec())
    }

    /// Fetch every layer into `dest`, named by the OCI title annotation.
    /// Gzipped tar layers are unpacked with path-safety checks; other layers
    /// are written as plain files.
    pub async fn pull_payload(&self, reference: &OciRef, dest: &Path) -> Result<()> {
        let manifest = self.fetch_manifest(reference).await?;
        std::fs::create_dir_all(dest)?;
        let mut total: u64 = 0;
        for layer in &manifest.layers {
            let blob = self.fetch_blob(reference, &layer.digest).await?;
            total += blob.len() as u64;
            if let Some(limit) = self.config.max_artifact_size_bytes {
                if total > limit {
                    return Err(OciError::PolicyDenied(format!(
                        "artifact exceeds size limit {limit} bytes"
                    )));
                }
            }
            if layer.media_type == LAYER_TAR_GZ_MEDIA_TYPE {
                unpack_tar_gz(&blob, dest)?;
            } else {
                let name = layer
                    .title()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| layer.digest.replace(':', "_"));
                let target = safe_extract_path(dest, &name)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, &blob)?;
            }
        }
        Ok(())
    }

    /// OCI referrers API; registries without it yield an empty list.
    pub async fn list_referrer_types(&self, reference: &OciRef) -> Result<Vec<String>> {
        let Some(digest) = reference.digest() else {
            return Ok(Vec::new());
        };
        let scheme = self.policy.scheme_for(&reference.host);
        let url = format!(
            "{scheme}://{}/v2/{}/referrers/{digest}",
            reference.host, reference.repository
        );
        let response = match self
            .send_with_retry(reference, || self.decorate(self.client.get(&url)))
            .await
        {
            Ok(response) => response,
            Err(OciError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let body: serde_json::Value = response.json().await.map_err(|err| transport_error(&err))?;
        let manifests = body
            .get("manifests")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(manifests
            .iter()
            .filter_map(|item| {
                item.get("artifactType")
                    .or_else(|| item.get("mediaType"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
            })
            .collect())
    }

    fn decorate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_with_retry<F>(&self, reference: &OciRef, make_request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attempts = self.config.max_retries.max(1);
        let mut last_detail = String::new();
        for attempt in 1..=attempts {
            match make_request().send().await {
                Ok(response) => {
                    let status = response.status();
                    match status.as_u16() {
                        200..=299 => return Ok(response),
                        404 => return Err(OciError::NotFound(reference.to_string())),
                        401 | 403 => return Err(OciError::AuthRequired(reference.to_string())),
                        429 => last_detail = format!("rate limited ({status})"),
                        500..=599 => last_detail = format!("status {status}"),
                        other => {
                            return Err(OciError::UpstreamUnavailable {
                                attempts: attempt,
                                detail: format!("unexpected status {other}"),
                            })
                        }
                    }
                }
                Err(err) => last_detail = scrubbed(&err),
            }
            if attempt < attempts {
                let backoff = self.config.backoff * attempt;
                tokio::time::sleep(backoff.min(Duration::from_secs(2))).await;
            }
        }
        if last_detail.starts_with("rate limited") {
            return Err(OciError::RateLimited(reference.to_string()));
        }
        Err(OciError::UpstreamUnavailable {
            attempts,
            detail: last_detail,
        })
    }
}

/// Recompute the SHA-256 of a fetched body and compare it with the digest
/// the caller asked for.
fn verify_body_digest(reference: &OciRef, expected: &str, body: &[u8]) -> Result<()> {
    let actual = format!("sha256:{}", sha256_hex(body));
    if actual != expected {
        return Err(OciError::DigestMismatch {
            reference: reference.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn header_digest(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("docker-content-digest")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn transport_error(err: &reqwest::Error) -> OciError {
    OciError::UpstreamUnavailable {
        attempts: 1,
        detail: scrubbed(err),
    }
}

fn scrubbed(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return "request timed out".to_string();
    }
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("bearer") || lowered.contains("authorization") {
        "<redacted transport error>".to_string()
    } else {
        message
    }
}

/// Unpack a gzipped tar blob into `dest`, rejecting absolute paths, parent
/// traversal, and symlink entries.
pub fn unpack_tar_gz(blob: &[u8], dest: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(blob);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(OciError::PathUnsafe(format!(
                "link entry in artifact archive: {}",
                entry.path().unwrap_or_default().display()
            )));
        }
        let rel = entry
            .path()
            .map_err(|err| OciError::PathUnsafe(err.to_string()))?
            .display()
            .to_string();
        if entry_type.is_dir() {
            let target = safe_extract_path(dest, &rel)?;
            std::fs::create_dir_all(target)?;
            continue;
        }
        let target = safe_extract_path(dest, &rel)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn tar_gz_with_entry(name: &str, content: &[u8]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn unpack_writes_safe_entries() {
        let dir = TempDir::new().unwrap();
        let blob = tar_gz_with_entry("payload/docs.jsonl", b"{}\n");
        unpack_tar_gz(&blob, dir.path()).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("payload/docs.jsonl")).unwrap(),
            b"{}\n"
        );
    }

    #[test]
    fn unpack_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let blob = tar_gz_with_entry("../escape.txt", b"nope");
        assert!(matches!(
            unpack_tar_gz(&blob, dir.path()),
            Err(OciError::PathUnsafe(_))
        ));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn body_digest_verification_accepts_matching_bytes() {
        let body = b"{\"schemaVersion\":2,\"layers\":[]}";
        let digest = format!("sha256:{}", sha256_hex(body));
        let reference = OciRef::parse(&format!("oci://reg.local/pkts/demo@{digest}")).unwrap();
        verify_body_digest(&reference, &digest, body).unwrap();
    }

    #[test]
    fn body_digest_verification_rejects_substituted_bytes() {
        let pinned = b"{\"schemaVersion\":2,\"layers\":[]}";
        let digest = format!("sha256:{}", sha256_hex(pinned));
        let reference = OciRef::parse(&format!("oci://reg.local/pkts/demo@{digest}")).unwrap();
        let err = verify_body_digest(&reference, &digest, b"{\"schemaVersion\":2,\"layers\":[{}]}")
            .unwrap_err();
        assert!(matches!(err, OciError::DigestMismatch { .. }), "{err}");
    }

    #[test]
    fn manifest_media_type_constant_matches_oci() {
        assert_eq!(
            crate::transport::OCI_MANIFEST_MEDIA_TYPE,
            "application/vnd.oci.image.manifest.v1+json"
        );
    }
}
