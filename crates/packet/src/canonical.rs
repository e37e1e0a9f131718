use crate::error::Result;
use serde::Serialize;
use std::path::Path;

/// Serialize a value as canonical JSON: UTF-8, object keys sorted, no
/// trailing whitespace, single trailing `\n`.
///
/// Key ordering comes from routing through `serde_json::Value`, whose object
/// representation is a `BTreeMap` (the `preserve_order` feature must stay
/// off).
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = serde_json::to_string(&value)?;
    out.push('\n');
    Ok(out)
}

/// Pretty canonical JSON for human-facing artifacts (manifest, lockfile):
/// two-space indent, sorted keys, trailing `\n`.
pub fn to_canonical_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = serde_json::to_string_pretty(&value)?;
    out.push('\n');
    Ok(out)
}

/// Write canonical JSON atomically: `<path>.tmp` then rename over `path`.
pub fn write_canonical_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = to_canonical_json_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// SHA-256 of the compact canonical JSON encoding of `value`.
pub fn canonical_json_sha256<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let compact = serde_json::to_string(&value)?;
    Ok(crate::hashing::sha256_hex(compact.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"zeta": 1, "alpha": {"nested_z": true, "nested_a": false}});
        let out = to_canonical_json(&value).unwrap();
        assert_eq!(
            out,
            "{\"alpha\":{\"nested_a\":false,\"nested_z\":true},\"zeta\":1}\n"
        );
    }

    #[test]
    fn config_hash_ignores_field_declaration_order() {
        #[derive(serde::Serialize)]
        struct A {
            b: u32,
            a: u32,
        }
        #[derive(serde::Serialize)]
        struct B {
            a: u32,
            b: u32,
        }
        let left = canonical_json_sha256(&A { b: 2, a: 1 }).unwrap();
        let right = canonical_json_sha256(&B { a: 1, b: 2 }).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        write_canonical_json(&path, &json!({"k": "v"})).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
