//! Chunking strategies, selected by file extension.
//!
//! Every strategy is a pure function `(text, source_id, ext, config) →
//! Vec<DocChunk>`: code files split on symbol boundaries, markdown on
//! heading sections, plain text on paragraphs. Chunk ids are
//! `<source_id>:<n>` with a per-file counter starting at 0.

use crate::budget::{pack_blocks, Block, BlockKind, PackedChunk};
use crate::config::{estimate_tokens, ChunkConfig};
use crate::error::{ChunkerError, Result};
use crate::language::{symbol_name_after, Language};
use cpm_packet::{sha256_hex, DocChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Code,
    Markdown,
    Text,
}

impl Strategy {
    #[must_use]
    pub fn for_ext(ext: &str) -> Self {
        match Language::from_ext(ext) {
            Language::Markdown => Self::Markdown,
            Language::Text | Language::Unknown => Self::Text,
            _ => Self::Code,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }
}

/// Chunk one file. Dispatches on extension, packs logical blocks with the
/// token budgeter, then materializes `DocChunk`s (optionally expanding
/// oversized symbol chunks into children).
pub fn chunk_file(
    text: &str,
    source_id: &str,
    ext: &str,
    config: &ChunkConfig,
) -> Result<Vec<DocChunk>> {
    if text.trim().is_empty() {
        return Err(ChunkerError::EmptyContent);
    }
    config.validate()?;

    let strategy = Strategy::for_ext(ext);
    let language = Language::from_ext(ext);
    let blocks = match strategy {
        Strategy::Code => code_blocks(text, language),
        Strategy::Markdown => markdown_blocks(text),
        Strategy::Text => text_blocks(text),
    };

    let packed = pack_blocks(blocks, config);

    let mut counter = 0usize;
    let mut chunks = Vec::with_capacity(packed.len());
    for piece in packed {
        let parent_id = format!("{source_id}:{counter}");
        counter += 1;
        let parent = materialize(&parent_id, &piece, source_id, ext, language, strategy);

        let expand = config.hierarchical
            && piece.has_symbols
            && estimate_tokens(&piece.text) > config.micro_budget_tokens * 2;
        chunks.push(parent);

        if expand {
            for (child_index, child) in
                child_pieces(&piece, config.micro_budget_tokens).into_iter().enumerate()
            {
                let child_id = format!("{source_id}:{counter}");
                counter += 1;
                let mut chunk =
                    materialize(&child_id, &child, source_id, ext, language, strategy);
                chunk
                    .metadata
                    .insert("parent_id".into(), parent_id.clone().into());
                chunk
                    .metadata
                    .insert("child_index".into(), child_index.into());
                chunks.push(chunk);
            }
        }
    }
    Ok(chunks)
}

fn materialize(
    id: &str,
    piece: &PackedChunk,
    source_id: &str,
    ext: &str,
    language: Language,
    strategy: Strategy,
) -> DocChunk {
    let mut chunk = DocChunk::new(
        id.to_string(),
        piece.text.clone(),
        sha256_hex(piece.text.as_bytes()),
    );
    chunk.metadata.insert("path".into(), source_id.into());
    chunk.metadata.insert("ext".into(), ext.into());
    chunk
        .metadata
        .insert("line_start".into(), piece.line_start.into());
    chunk
        .metadata
        .insert("line_end".into(), piece.line_end.into());
    chunk
        .metadata
        .insert("lang".into(), language.as_str().into());
    chunk
        .metadata
        .insert("kind".into(), strategy.as_str().into());
    if let Some(symbol) = &piece.symbol {
        chunk.metadata.insert("symbol".into(), symbol.clone().into());
    }
    chunk
}

/// Split a code file into a preamble block plus one block per top-level
/// symbol, falling back to the whole file when no markers match.
fn code_blocks(text: &str, language: Language) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let markers = language.symbol_markers();

    let mut boundaries: Vec<(usize, Option<String>)> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        // Only unindented (top-level) lines open a new symbol block.
        let indented = line.len() != trimmed.len();
        if indented {
            continue;
        }
        for marker in markers {
            if trimmed.starts_with(marker) {
                boundaries.push((idx, symbol_name_after(line, marker)));
                break;
            }
        }
    }

    if boundaries.is_empty() {
        return vec![Block {
            kind: BlockKind::Preamble,
            text: text.trim_end_matches('\n').to_string(),
            line_start: 1,
            line_end: lines.len().max(1),
            symbol: None,
        }];
    }

    let mut blocks = Vec::new();
    let first_symbol_line = boundaries[0].0;
    if first_symbol_line > 0 {
        blocks.push(Block {
            kind: BlockKind::Preamble,
            text: lines[..first_symbol_line].join("\n"),
            line_start: 1,
            line_end: first_symbol_line,
            symbol: None,
        });
    }
    for (pos, (start, symbol)) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(pos + 1)
            .map(|(next, _)| *next)
            .unwrap_or(lines.len());
        blocks.push(Block {
            kind: BlockKind::Symbol,
            text: lines[*start..end].join("\n"),
            line_start: start + 1,
            line_end: end,
            symbol: symbol.clone(),
        });
    }
    blocks
}

/// One block per heading section; a leading un-headed prefix becomes the
/// preamble.
fn markdown_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut in_fence = false;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence && trimmed.starts_with('#') {
            let title = trimmed.trim_start_matches('#').trim().to_string();
            headings.push((idx, title));
        }
    }

    if headings.is_empty() {
        return text_blocks(text);
    }

    let mut blocks = Vec::new();
    if headings[0].0 > 0 {
        blocks.push(Block {
            kind: BlockKind::Preamble,
            text: lines[..headings[0].0].join("\n"),
            line_start: 1,
            line_end: headings[0].0,
            symbol: None,
        });
    }
    for (pos, (start, title)) in headings.iter().enumerate() {
        let end = headings
            .get(pos + 1)
            .map(|(next, _)| *next)
            .unwrap_or(lines.len());
        blocks.push(Block {
            kind: BlockKind::Symbol,
            text: lines[*start..end].join("\n"),
            line_start: start + 1,
            line_end: end,
            symbol: if title.is_empty() {
                None
            } else {
                Some(title.clone())
            },
        });
    }
    blocks
}

/// Paragraph blocks for plain text (blank-line separated).
fn text_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            if let Some(begin) = start.take() {
                blocks.push(Block {
                    kind: BlockKind::Preamble,
                    text: lines[begin..idx].join("\n"),
                    line_start: begin + 1,
                    line_end: idx,
                    symbol: None,
                });
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(begin) = start {
        blocks.push(Block {
            kind: BlockKind::Preamble,
            text: lines[begin..].join("\n"),
            line_start: begin + 1,
            line_end: lines.len(),
            symbol: None,
        });
    }
    blocks
}

/// Micro-budget children of an oversize parent chunk.
fn child_pieces(parent: &PackedChunk, micro_budget: usize) -> Vec<PackedChunk> {
    let lines: Vec<&str> = parent.text.lines().collect();
    let mut pieces = Vec::new();
    let mut piece: Vec<&str> = Vec::new();
    let mut tokens = 0usize;
    let mut piece_start = parent.line_start;
    let mut line_no = parent.line_start;

    for line in lines {
        let t = estimate_tokens(line);
        if !piece.is_empty() && tokens + t > micro_budget {
            pieces.push(PackedChunk {
                text: piece.join("\n"),
                line_start: piece_start,
                line_end: line_no.saturating_sub(1),
                symbol: parent.symbol.clone(),
                has_symbols: false,
            });
            piece.clear();
            tokens = 0;
            piece_start = line_no;
        }
        piece.push(line);
        tokens += t;
        line_no += 1;
    }
    if !piece.is_empty() {
        pieces.push(PackedChunk {
            text: piece.join("\n"),
            line_start: piece_start,
            line_end: parent.line_end,
            symbol: parent.symbol.clone(),
            has_symbols: false,
        });
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY_CODE: &str = "import os\nimport sys\n\ndef alpha():\n    return 1\n\ndef beta():\n    return 2\n\nclass Gamma:\n    def method(self):\n        pass\n";

    #[test]
    fn strategy_selection_by_extension() {
        assert_eq!(Strategy::for_ext(".py"), Strategy::Code);
        assert_eq!(Strategy::for_ext(".md"), Strategy::Markdown);
        assert_eq!(Strategy::for_ext(".txt"), Strategy::Text);
    }

    #[test]
    fn chunk_ids_use_per_file_counter() {
        let config = ChunkConfig {
            chunk_tokens: 8,
            overlap_tokens: 2,
            hard_cap_tokens: 64,
            ..Default::default()
        };
        let chunks = chunk_file(PY_CODE, "src/mod.py", ".py", &config).unwrap();
        assert!(chunks.len() > 1);
        for (idx, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, format!("src/mod.py:{idx}"));
            assert_eq!(chunk.meta_str("path"), Some("src/mod.py"));
            assert_eq!(chunk.meta_str("ext"), Some(".py"));
        }
    }

    #[test]
    fn code_strategy_detects_symbols() {
        let config = ChunkConfig {
            chunk_tokens: 6,
            overlap_tokens: 0,
            hard_cap_tokens: 64,
            ..Default::default()
        };
        let chunks = chunk_file(PY_CODE, "src/mod.py", ".py", &config).unwrap();
        let symbols: Vec<&str> = chunks
            .iter()
            .filter_map(|c| c.meta_str("symbol"))
            .collect();
        assert!(symbols.contains(&"alpha"));
        assert!(symbols.iter().any(|s| *s == "beta" || *s == "Gamma"));
    }

    #[test]
    fn markdown_strategy_splits_on_headings() {
        let md = "intro text\n\n# First\nbody one\n\n# Second\nbody two\n";
        let config = ChunkConfig {
            chunk_tokens: 4,
            overlap_tokens: 0,
            hard_cap_tokens: 64,
            ..Default::default()
        };
        let chunks = chunk_file(md, "README.md", ".md", &config).unwrap();
        let symbols: Vec<&str> = chunks
            .iter()
            .filter_map(|c| c.meta_str("symbol"))
            .collect();
        assert!(symbols.contains(&"First"));
        assert!(symbols.contains(&"Second"));
    }

    #[test]
    fn hash_is_sha256_of_text() {
        let config = ChunkConfig::default();
        let chunks = chunk_file("just a paragraph", "notes.txt", ".txt", &config).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].hash,
            sha256_hex(chunks[0].text.as_bytes()),
        );
    }

    #[test]
    fn hierarchical_mode_emits_children_with_back_references() {
        let long_fn = format!(
            "def big():\n{}",
            (0..120)
                .map(|i| format!("    value_{i} = compute_{i}()"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let config = ChunkConfig {
            chunk_tokens: 2000,
            overlap_tokens: 0,
            hard_cap_tokens: 4000,
            hierarchical: true,
            micro_budget_tokens: 100,
            ..Default::default()
        };
        let chunks = chunk_file(&long_fn, "src/big.py", ".py", &config).unwrap();
        assert!(chunks.len() > 1);
        let parent_id = chunks[0].id.clone();
        let children: Vec<&DocChunk> = chunks
            .iter()
            .filter(|c| c.meta_str("parent_id") == Some(parent_id.as_str()))
            .collect();
        assert!(!children.is_empty());
        assert_eq!(children[0].meta_int("child_index"), Some(0));
    }

    #[test]
    fn empty_content_is_rejected() {
        assert!(chunk_file("   \n", "a.txt", ".txt", &ChunkConfig::default()).is_err());
    }
}
