use crate::error::{PacketError, Result};
use crate::types::DocChunk;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const DOCS_FILE: &str = "docs.jsonl";

/// Write `docs.jsonl`: one chunk per line, LF terminators, stable key order
/// (`id`, `text`, `hash`, `metadata` with sorted metadata keys).
pub fn write_docs_jsonl(path: &Path, chunks: &[DocChunk]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    for chunk in chunks {
        let line = serde_json::to_string(chunk)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every chunk of a `docs.jsonl`. Row `i` of the packet's vector file
/// corresponds to the `i`-th returned chunk.
pub fn read_docs_jsonl(path: &Path) -> Result<Vec<DocChunk>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut chunks = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: DocChunk =
            serde_json::from_str(&line).map_err(|err| PacketError::MalformedDocs {
                line: idx + 1,
                reason: err.to_string(),
            })?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Byte-offset table over a `docs.jsonl`, letting callers load single
/// document lines lazily instead of keeping every chunk text resident.
pub struct DocsOffsets {
    offsets: Vec<(u64, u64)>,
}

impl DocsOffsets {
    /// Scan the file once, recording `(start, len)` per non-empty line.
    pub fn scan(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut offsets = Vec::new();
        let mut pos: u64 = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            let mut len = read as u64;
            if buf.ends_with(b"\n") {
                len -= 1;
            }
            if len > 0 {
                offsets.push((pos, len));
            }
            pos += read as u64;
        }
        Ok(Self { offsets })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Load and parse the `row`-th document line.
    pub fn load(&self, path: &Path, row: usize) -> Result<DocChunk> {
        let (start, len) = *self
            .offsets
            .get(row)
            .ok_or_else(|| PacketError::MalformedDocs {
                line: row + 1,
                reason: format!("row {row} out of range ({} docs)", self.offsets.len()),
            })?;
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        serde_json::from_slice(&buf).map_err(|err| PacketError::MalformedDocs {
            line: row + 1,
            reason: err.to_string(),
        })
    }
}
