//! Host allowlist, scheme policy, trust verification, and redaction.
//!
//! Every check here runs before the first HTTP call; tokens never reach a
//! log line or an error string.

use crate::error::{OciError, Result};
use crate::uri::OciRef;
use std::path::{Component, Path, PathBuf};

pub const SIGNATURE_ARTIFACT_TYPE: &str = "application/vnd.dev.cosign.simulated.v1+json";
pub const SBOM_ARTIFACT_TYPE: &str = "application/vnd.cpm.sbom.simulated.v1+json";
pub const PROVENANCE_ARTIFACT_TYPE: &str = "application/vnd.cpm.provenance.simulated.v1+json";

#[derive(Debug, Clone)]
pub struct OciPolicy {
    /// Empty allowlist admits every host.
    pub allowlist_hosts: Vec<String>,
    /// Permit plain-http registries beyond loopback.
    pub allow_http: bool,
    /// Fail closed when required attestations are absent.
    pub strict_verify: bool,
}

impl Default for OciPolicy {
    fn default() -> Self {
        Self {
            allowlist_hosts: Vec::new(),
            allow_http: false,
            strict_verify: true,
        }
    }
}

impl OciPolicy {
    /// Host allowlist: exact match or subdomain of an allowed suffix.
    pub fn check_host(&self, reference: &OciRef) -> Result<()> {
        if self.allowlist_hosts.is_empty() {
            return Ok(());
        }
        let host = host_without_port(&reference.host);
        for allowed in &self.allowlist_hosts {
            let key = allowed.trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            if host == key || host.ends_with(&format!(".{key}")) {
                return Ok(());
            }
        }
        Err(OciError::PolicyDenied(format!(
            "registry host '{host}' is not in the allowlist"
        )))
    }

    /// Scheme selection for a host: https unless the host is loopback or
    /// plain http was explicitly allowed.
    #[must_use]
    pub fn scheme_for(&self, host: &str) -> &'static str {
        if is_loopback(host) || self.allow_http {
            "http"
        } else {
            "https"
        }
    }

    /// Trust gate over the referrer artifact types discovered for a digest.
    /// Strict mode requires a signature attestation and fails closed.
    pub fn verify_trust(&self, reference: &OciRef, referrer_types: &[String]) -> Result<()> {
        if !self.strict_verify {
            return Ok(());
        }
        let has_signature = referrer_types
            .iter()
            .any(|t| t == SIGNATURE_ARTIFACT_TYPE || t.contains("cosign"));
        if !has_signature {
            return Err(OciError::PolicyDenied(format!(
                "strict verification: no signature attestation found for {reference}"
            )));
        }
        Ok(())
    }
}

fn host_without_port(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

#[must_use]
pub fn is_loopback(host: &str) -> bool {
    let bare = host_without_port(host);
    bare == "localhost" || bare == "127.0.0.1" || bare == "::1"
}

/// Join a relative artifact path under `base`, rejecting absolute paths,
/// `..` components, and anything that would land outside the extraction
/// root.
pub fn safe_extract_path(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let mut depth: i32 = 0;
    for component in rel.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(OciError::PathUnsafe(format!(
                    "absolute path in artifact: {relative}"
                )));
            }
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(OciError::PathUnsafe(format!(
                        "path traversal in artifact: {relative}"
                    )));
                }
            }
            Component::CurDir => {}
            Component::Normal(_) => depth += 1,
        }
    }
    if depth == 0 {
        return Err(OciError::PathUnsafe(format!("empty artifact path: {relative}")));
    }
    Ok(base.join(rel))
}

/// Shorten a credential for a log line: first 3 + last 2 characters.
#[must_use]
pub fn redact_token(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.len() <= 6 {
        return "***".to_string();
    }
    format!("{}***{}", &value[..3], &value[value.len() - 2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_ref(host: &str) -> OciRef {
        OciRef::parse(&format!("oci://{host}/pkts/demo:latest")).unwrap()
    }

    #[test]
    fn empty_allowlist_admits_everything() {
        let policy = OciPolicy::default();
        policy.check_host(&demo_ref("anything.example")).unwrap();
    }

    #[test]
    fn allowlist_matches_exact_and_subdomains() {
        let policy = OciPolicy {
            allowlist_hosts: vec!["example.com".to_string()],
            ..Default::default()
        };
        policy.check_host(&demo_ref("example.com")).unwrap();
        policy.check_host(&demo_ref("reg.example.com")).unwrap();
        assert!(policy.check_host(&demo_ref("evil.net")).is_err());
        assert!(policy.check_host(&demo_ref("notexample.com")).is_err());
    }

    #[test]
    fn loopback_hosts_get_http() {
        let policy = OciPolicy::default();
        assert_eq!(policy.scheme_for("localhost:5000"), "http");
        assert_eq!(policy.scheme_for("127.0.0.1"), "http");
        assert_eq!(policy.scheme_for("ghcr.io"), "https");
    }

    #[test]
    fn strict_trust_fails_closed_without_signature() {
        let policy = OciPolicy::default();
        let reference = demo_ref("reg.local");
        assert!(policy.verify_trust(&reference, &[]).is_err());
        assert!(policy
            .verify_trust(&reference, &[SBOM_ARTIFACT_TYPE.to_string()])
            .is_err());
        policy
            .verify_trust(&reference, &[SIGNATURE_ARTIFACT_TYPE.to_string()])
            .unwrap();

        let lax = OciPolicy {
            strict_verify: false,
            ..Default::default()
        };
        lax.verify_trust(&reference, &[]).unwrap();
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        let base = Path::new("/cas/payload");
        assert!(safe_extract_path(base, "docs.jsonl").is_ok());
        assert!(safe_extract_path(base, "faiss/index.faiss").is_ok());
        assert!(safe_extract_path(base, "../escape").is_err());
        assert!(safe_extract_path(base, "a/../../escape").is_err());
        assert!(safe_extract_path(base, "/etc/passwd").is_err());
        assert!(safe_extract_path(base, "").is_err());
    }

    #[test]
    fn token_redaction_keeps_edges_only() {
        assert_eq!(redact_token("abcdefghij"), "abc***ij");
        assert_eq!(redact_token("short"), "***");
        assert_eq!(redact_token(""), "");
    }
}
