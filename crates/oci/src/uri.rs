//! OCI reference parsing and normalization.
//!
//! Accepted inputs: `oci://host/repo/name@sha256:<digest>`,
//! `oci://host/repo/name:<alias>`, `oci://host/repo/name@<semver>`, and the
//! two-part form `(registry_base, "name@version" | "name:alias")`. Any
//! non-digest reference must be resolved to a digest before the first blob
//! fetch.

use crate::error::{OciError, Result};
use std::fmt;

pub const OCI_SCHEME: &str = "oci://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Digest(String),
    Tag(String),
}

impl Reference {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Digest(digest) => digest,
            Self::Tag(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciRef {
    pub host: String,
    /// Repository path including the packet name, e.g. `team/packets/demo`.
    pub repository: String,
    pub reference: Reference,
}

impl OciRef {
    pub fn parse(uri: &str) -> Result<Self> {
        let raw = uri.trim();
        let body = raw.strip_prefix(OCI_SCHEME).ok_or_else(|| invalid(raw, "missing oci:// scheme"))?;
        let body = body.trim_matches('/');
        if body.is_empty() {
            return Err(invalid(raw, "empty reference"));
        }

        let (path, reference) = split_reference(raw, body)?;
        let (host, repository) = path
            .split_once('/')
            .ok_or_else(|| invalid(raw, "expected host/repository"))?;
        if host.is_empty() || repository.is_empty() {
            return Err(invalid(raw, "expected host/repository"));
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            repository: repository.to_string(),
            reference,
        })
    }

    /// Combine a registry base (`host/path` or `oci://host/path`) with a
    /// short `name@version` / `name:alias` / plain-name form.
    pub fn from_parts(registry_base: &str, short_ref: &str) -> Result<Self> {
        let base = registry_base
            .trim()
            .trim_start_matches(OCI_SCHEME)
            .trim_matches('/');
        if base.is_empty() {
            return Err(invalid(short_ref, "registry base is empty"));
        }
        let short = short_ref.trim().trim_start_matches('/');
        if short.is_empty() {
            return Err(invalid(short_ref, "packet reference is empty"));
        }
        let last_segment = short.rsplit('/').next().unwrap_or(short);
        let tagged = if short.contains('@') || last_segment.contains(':') {
            short.to_string()
        } else {
            format!("{short}:latest")
        };
        Self::parse(&format!("{OCI_SCHEME}{base}/{tagged}"))
    }

    /// Normalize a user-supplied ref: full `oci://` URI, or a short form
    /// joined against the configured registry.
    pub fn normalize(raw: &str, registry_base: Option<&str>) -> Result<Self> {
        if raw.trim().starts_with(OCI_SCHEME) {
            return Self::parse(raw);
        }
        match registry_base {
            Some(base) => Self::from_parts(base, raw),
            None => Err(invalid(
                raw,
                "not an oci:// URI and no default registry configured",
            )),
        }
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(self.reference, Reference::Digest(_))
    }

    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        match &self.reference {
            Reference::Digest(digest) => Some(digest),
            Reference::Tag(_) => None,
        }
    }

    /// The same repository pinned to a digest.
    #[must_use]
    pub fn pinned(&self, digest: &str) -> Self {
        Self {
            host: self.host.clone(),
            repository: self.repository.clone(),
            reference: Reference::Digest(digest.to_string()),
        }
    }

    /// Canonical `oci://host/repo@sha256:<digest>` form.
    #[must_use]
    pub fn pinned_uri(&self, digest: &str) -> String {
        format!("{OCI_SCHEME}{}/{}@{digest}", self.host, self.repository)
    }

    /// Key for the alias TTL cache: `(host, repository, alias)` hashed.
    #[must_use]
    pub fn alias_hash(&self) -> String {
        let raw = format!("{}\u{1f}{}\u{1f}{}", self.host, self.repository, self.reference.as_str());
        cpm_packet::sha256_hex(raw.as_bytes())[..24].to_string()
    }
}

impl fmt::Display for OciRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = match &self.reference {
            Reference::Digest(_) => "@",
            Reference::Tag(_) => ":",
        };
        write!(
            f,
            "{OCI_SCHEME}{}/{}{separator}{}",
            self.host,
            self.repository,
            self.reference.as_str()
        )
    }
}

fn split_reference(raw: &str, body: &str) -> Result<(String, Reference)> {
    if let Some((path, digest)) = body.split_once("@sha256:") {
        let digest = format!("sha256:{digest}");
        if !is_valid_digest(&digest) {
            return Err(invalid(raw, "malformed sha256 digest"));
        }
        return Ok((path.to_string(), Reference::Digest(digest)));
    }
    if let Some((path, version)) = body.rsplit_once('@') {
        if version.is_empty() {
            return Err(invalid(raw, "empty version after '@'"));
        }
        // `@<semver>` resolves through the same tag machinery as aliases.
        return Ok((path.to_string(), Reference::Tag(version.to_string())));
    }
    if let Some((path, tag)) = rsplit_tag(body) {
        return Ok((path.to_string(), Reference::Tag(tag.to_string())));
    }
    Ok((body.to_string(), Reference::Tag("latest".to_string())))
}

/// Split a trailing `:tag` only when the colon appears after the last `/`
/// (so `host:5000/repo/name` keeps its port).
fn rsplit_tag(body: &str) -> Option<(&str, &str)> {
    let last_slash = body.rfind('/')?;
    let tail = &body[last_slash + 1..];
    let colon = tail.rfind(':')?;
    let split_at = last_slash + 1 + colon;
    Some((&body[..split_at], &body[split_at + 1..]))
}

#[must_use]
pub fn is_valid_digest(digest: &str) -> bool {
    let Some(hex) = digest.strip_prefix("sha256:") else {
        return false;
    };
    hex.len() == 64 && hex.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase())
}

fn invalid(reference: &str, reason: &str) -> OciError {
    OciError::InvalidRef {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn parses_digest_pinned_uri() {
        let parsed = OciRef::parse(&format!("oci://ghcr.io/team/packets/demo@{DIGEST}")).unwrap();
        assert_eq!(parsed.host, "ghcr.io");
        assert_eq!(parsed.repository, "team/packets/demo");
        assert!(parsed.is_pinned());
        assert_eq!(parsed.digest(), Some(DIGEST));
    }

    #[test]
    fn parses_alias_and_semver_forms() {
        let alias = OciRef::parse("oci://reg.local/pkts/demo:latest").unwrap();
        assert_eq!(alias.reference, Reference::Tag("latest".to_string()));

        let semver = OciRef::parse("oci://reg.local/pkts/demo@1.2.3").unwrap();
        assert_eq!(semver.reference, Reference::Tag("1.2.3".to_string()));
        assert!(!semver.is_pinned());
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let parsed = OciRef::parse("oci://localhost:5000/pkts/demo").unwrap();
        assert_eq!(parsed.host, "localhost:5000");
        assert_eq!(parsed.repository, "pkts/demo");
        assert_eq!(parsed.reference, Reference::Tag("latest".to_string()));

        let tagged = OciRef::parse("oci://localhost:5000/pkts/demo:v1").unwrap();
        assert_eq!(tagged.reference, Reference::Tag("v1".to_string()));
    }

    #[test]
    fn two_part_form_joins_against_registry() {
        let joined = OciRef::from_parts("reg.local/pkts", "demo@1.0.0").unwrap();
        assert_eq!(joined.host, "reg.local");
        assert_eq!(joined.repository, "pkts/demo");
        assert_eq!(joined.reference, Reference::Tag("1.0.0".to_string()));

        let aliased = OciRef::from_parts("oci://reg.local/pkts/", "demo:stable").unwrap();
        assert_eq!(aliased.reference, Reference::Tag("stable".to_string()));

        let bare = OciRef::from_parts("reg.local/pkts", "demo").unwrap();
        assert_eq!(bare.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn normalize_requires_registry_for_short_forms() {
        assert!(OciRef::normalize("demo:latest", None).is_err());
        let normalized = OciRef::normalize("demo:latest", Some("reg.local/pkts")).unwrap();
        assert_eq!(normalized.to_string(), "oci://reg.local/pkts/demo:latest");
    }

    #[test]
    fn malformed_digests_are_rejected() {
        assert!(OciRef::parse("oci://reg.local/pkts/demo@sha256:short").is_err());
        assert!(!is_valid_digest("sha256:XYZ"));
        assert!(is_valid_digest(DIGEST));
    }

    #[test]
    fn pinned_uri_is_canonical() {
        let parsed = OciRef::parse("oci://reg.local/pkts/demo:latest").unwrap();
        assert_eq!(
            parsed.pinned_uri(DIGEST),
            format!("oci://reg.local/pkts/demo@{DIGEST}")
        );
    }

    #[test]
    fn alias_hash_distinguishes_tags() {
        let a = OciRef::parse("oci://reg.local/pkts/demo:latest").unwrap();
        let b = OciRef::parse("oci://reg.local/pkts/demo:stable").unwrap();
        assert_ne!(a.alias_hash(), b.alias_hash());
    }
}
