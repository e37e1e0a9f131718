//! Flat inner-product nearest-neighbor index.
//!
//! Brute-force scored scan over L2-normalized rows; inner product over
//! normalized vectors equals cosine similarity, which is the packet
//! similarity contract. The persisted format is bit-reproducible for
//! identical input: fixed header, then row-major little-endian f32 rows in
//! insertion order.

use crate::error::{PacketError, Result};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub const INDEX_DIR: &str = "faiss";
pub const INDEX_FILE: &str = "faiss/index.faiss";

const INDEX_MAGIC: &[u8; 4] = b"CPMI";
const INDEX_FORMAT_VERSION: u32 = 1;

pub struct FlatIpIndex {
    dimension: usize,
    rows: Vec<Vec<f32>>,
}

impl FlatIpIndex {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Vec::new(),
        }
    }

    /// Build from an already-normalized matrix; row order is preserved and
    /// row index is the search id.
    pub fn from_rows(dimension: usize, rows: Vec<Vec<f32>>) -> Result<Self> {
        for row in &rows {
            if row.len() != dimension {
                return Err(PacketError::InvalidDimension {
                    expected: dimension,
                    actual: row.len(),
                });
            }
        }
        Ok(Self { dimension, rows })
    }

    pub fn add(&mut self, row: Vec<f32>) -> Result<()> {
        if row.len() != self.dimension {
            return Err(PacketError::InvalidDimension {
                expected: self.dimension,
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Top-k rows by inner product, `(row, score)` sorted by descending
    /// score; equal scores ordered by ascending row index.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(PacketError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scores: Vec<(usize, f32)> = self
            .rows
            .iter()
            .enumerate()
            .map(|(row, vector)| (row, dot(query, vector)))
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);
        Ok(scores)
    }

    /// Top-k with a caller-supplied label per row; equal scores ordered by
    /// ascending label. This is the query-path entry point, where labels are
    /// chunk ids.
    pub fn search_labeled(&self, query: &[f32], k: usize, labels: &[String]) -> Result<Vec<(usize, f32)>> {
        if labels.len() != self.rows.len() {
            return Err(PacketError::Other(format!(
                "label count {} does not match index rows {}",
                labels.len(),
                self.rows.len()
            )));
        }
        if query.len() != self.dimension {
            return Err(PacketError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scores: Vec<(usize, f32)> = self
            .rows
            .iter()
            .enumerate()
            .map(|(row, vector)| (row, dot(query, vector)))
            .collect();
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| labels[a.0].cmp(&labels[b.0]))
        });
        scores.truncate(k);
        Ok(scores)
    }

    /// Persist with reproducible bytes: magic, format version, dim, count,
    /// then rows as little-endian f32. Written to a temp file and renamed,
    /// so the final path only ever holds a complete index; an interrupted
    /// write leaves no `index.faiss` and readers treat the build as stale.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("faiss.tmp");
        {
            let file = std::fs::File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(INDEX_MAGIC)?;
            writer.write_all(&INDEX_FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&(self.dimension as u32).to_le_bytes())?;
            writer.write_all(&(self.rows.len() as u32).to_le_bytes())?;
            for row in &self.rows {
                for value in row {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut header = [0u8; 16];
        file.read_exact(&mut header)
            .map_err(|_| PacketError::MalformedIndex("truncated header".to_string()))?;
        if &header[0..4] != INDEX_MAGIC {
            return Err(PacketError::MalformedIndex("bad magic".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != INDEX_FORMAT_VERSION {
            return Err(PacketError::MalformedIndex(format!(
                "unsupported index format version {version}"
            )));
        }
        let dimension = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let count = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let expected = count * dimension * 4;
        if raw.len() != expected {
            return Err(PacketError::MalformedIndex(format!(
                "expected {expected} payload bytes, found {}",
                raw.len()
            )));
        }

        let mut rows = Vec::with_capacity(count);
        for row in raw.chunks_exact(dimension * 4) {
            let mut out = Vec::with_capacity(dimension);
            for quad in row.chunks_exact(4) {
                out.push(f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
            }
            rows.push(out);
        }
        Ok(Self { dimension, rows })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn search_ranks_by_inner_product() {
        let mut index = FlatIpIndex::new(3);
        index.add(vec![1.0, 0.0, 0.0]).unwrap();
        index.add(vec![0.9, 0.1, 0.0]).unwrap();
        index.add(vec![0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn equal_scores_break_ties_by_ascending_label() {
        let mut index = FlatIpIndex::new(2);
        // Rows 0 and 1 are identical; labels invert the row order.
        index.add(vec![1.0, 0.0]).unwrap();
        index.add(vec![1.0, 0.0]).unwrap();
        let labels = vec!["src/z.rs:0".to_string(), "src/a.rs:0".to_string()];

        let hits = index.search_labeled(&[1.0, 0.0], 2, &labels).unwrap();
        assert_eq!(labels[hits[0].0], "src/a.rs:0");
        assert_eq!(labels[hits[1].0], "src/z.rs:0");
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let mut index = FlatIpIndex::new(3);
        assert!(index.add(vec![1.0, 0.0]).is_err());
        index.add(vec![1.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn save_is_byte_reproducible() {
        let dir = TempDir::new().unwrap();
        let rows = vec![vec![1.0f32, 0.0], vec![0.5, 0.5]];
        let index = FlatIpIndex::from_rows(2, rows).unwrap();

        let first = dir.path().join("a.faiss");
        let second = dir.path().join("b.faiss");
        index.save(&first).unwrap();
        index.save(&second).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn load_roundtrips_and_rejects_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.faiss");
        let index = FlatIpIndex::from_rows(2, vec![vec![1.0f32, 0.0]]).unwrap();
        index.save(&path).unwrap();

        let back = FlatIpIndex::load(&path).unwrap();
        assert_eq!(back.dimension(), 2);
        assert_eq!(back.len(), 1);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(FlatIpIndex::load(&path).is_err());
    }
}
