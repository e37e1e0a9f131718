//! Flat `cpm.yml` read/write.
//!
//! The file is a fixed set of `key: value` lines with CSV lists; quoting is
//! applied only when a value contains characters that would break the flat
//! form. No YAML dependency is pulled in for this.

use crate::error::{PacketError, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

pub const CPM_YML_FILE: &str = "cpm.yml";
pub const CPM_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct CpmYml {
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: Vec<String>,
    pub entrypoints: Vec<String>,
    pub embedding_model: String,
    pub embedding_dim: u32,
    pub embedding_normalized: bool,
    /// RFC 3339 UTC, supplied by the caller's clock.
    pub created_at: String,
}

impl CpmYml {
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        writeln!(writer, "cpm_schema: {CPM_SCHEMA_VERSION}")?;
        writeln!(writer, "name: {}", escape(&self.name))?;
        writeln!(writer, "version: {}", escape(&self.version))?;
        writeln!(writer, "description: {}", escape(&self.description))?;
        writeln!(writer, "tags: {}", escape(&self.tags.join(",")))?;
        writeln!(writer, "entrypoints: {}", escape(&self.entrypoints.join(",")))?;
        writeln!(writer, "embedding_model: {}", escape(&self.embedding_model))?;
        writeln!(writer, "embedding_dim: {}", self.embedding_dim)?;
        writeln!(
            writer,
            "embedding_normalized: {}",
            if self.embedding_normalized { "true" } else { "false" }
        )?;
        writeln!(writer, "created_at: {}", escape(&self.created_at))?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let map = parse_flat(&raw);
        let get = |key: &str| -> Result<String> {
            map.get(key)
                .cloned()
                .ok_or_else(|| PacketError::MalformedManifest(format!("cpm.yml missing key '{key}'")))
        };

        Ok(Self {
            name: get("name")?,
            version: get("version")?,
            description: map.get("description").cloned().unwrap_or_default(),
            tags: split_csv(map.get("tags").map(String::as_str).unwrap_or("")),
            entrypoints: split_csv(map.get("entrypoints").map(String::as_str).unwrap_or("")),
            embedding_model: get("embedding_model")?,
            embedding_dim: get("embedding_dim")?.parse().map_err(|_| {
                PacketError::MalformedManifest("cpm.yml embedding_dim is not an integer".into())
            })?,
            embedding_normalized: map
                .get("embedding_normalized")
                .map(|v| v == "true")
                .unwrap_or(false),
            created_at: get("created_at")?,
        })
    }
}

fn escape(value: &str) -> String {
    if value
        .chars()
        .any(|ch| matches!(ch, ':' | '#' | '\n' | '\r' | '\t'))
    {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn unescape(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\\\"", "\"")
    } else {
        trimmed.to_string()
    }
}

fn parse_flat(raw: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        map.insert(key.trim().to_string(), unescape(value));
    }
    map
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}
