use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 hex digest of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

/// SHA-256 hex digest of a file, streamed in 1 MiB blocks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_lower(&hasher.finalize()))
}

/// Domain-separated fold over an ordered list of labelled digests.
///
/// Each item contributes `label <US> value <RS>` so that reordering or
/// re-bracketing the inputs always changes the result.
#[must_use]
pub fn fold_sha256(domain: &str, items: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([0u8]);
    for (label, value) in items {
        hasher.update(label.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    hex_lower(&hasher.finalize())
}

/// `packet_id = H(name ‖ version ‖ build_profile ‖ normalized_source_path ‖ config_hash)`
/// with labelled, domain-separated fields; bit-exact for identical inputs.
#[must_use]
pub fn compute_packet_id(
    name: &str,
    version: &str,
    build_profile: &str,
    normalized_source_path: &str,
    config_hash: &str,
) -> String {
    fold_sha256(
        "cpm.packet-id.v1",
        &[
            ("name".to_string(), name.to_string()),
            ("version".to_string(), version.to_string()),
            ("build_profile".to_string(), build_profile.to_string()),
            ("source".to_string(), normalized_source_path.to_string()),
            ("config_hash".to_string(), config_hash.to_string()),
        ],
    )
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
