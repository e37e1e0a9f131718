//! Lazy access to a packet's `docs.jsonl`: one streaming scan collects
//! chunk ids and byte offsets; hit texts are loaded row by row afterwards.

use crate::error::Result;
use cpm_packet::{DocChunk, DocsOffsets};
use serde::Deserialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

pub struct DocsIndex {
    path: PathBuf,
    offsets: DocsOffsets,
    ids: Vec<String>,
}

impl DocsIndex {
    pub fn scan(path: &Path) -> Result<Self> {
        let offsets = DocsOffsets::scan(path)?;

        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut ids = Vec::with_capacity(offsets.len());
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let head: IdOnly = serde_json::from_str(&line).map_err(cpm_packet::PacketError::from)?;
            ids.push(head.id);
        }

        Ok(Self {
            path: path.to_path_buf(),
            offsets,
            ids,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Load the full chunk for one row.
    pub fn load_row(&self, row: usize) -> Result<DocChunk> {
        Ok(self.offsets.load(&self.path, row)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpm_packet::{sha256_hex, write_docs_jsonl};
    use tempfile::TempDir;

    #[test]
    fn scan_collects_ids_and_loads_rows_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("docs.jsonl");
        let chunks: Vec<DocChunk> = (0..3)
            .map(|i| {
                let text = format!("chunk body {i}");
                DocChunk::new(format!("src/a.py:{i}"), text.clone(), sha256_hex(text.as_bytes()))
            })
            .collect();
        write_docs_jsonl(&path, &chunks).unwrap();

        let index = DocsIndex::scan(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.ids()[2], "src/a.py:2");
        assert_eq!(index.load_row(1).unwrap(), chunks[1]);
    }
}
