//! Token budgeter: packs ordered logical blocks into chunks.
//!
//! Invariants:
//! - source order is preserved;
//! - no chunk exceeds `hard_cap_tokens` (oversize blocks are line-split
//!   before packing);
//! - at most `max_symbol_blocks_per_chunk` symbol blocks per chunk;
//! - the overlap between adjacent chunks is a suffix of the previous chunk
//!   repeated as the prefix of the next, bounded by `overlap_tokens`.

use crate::config::{estimate_tokens, ChunkConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Preamble,
    Symbol,
    SymbolChild,
}

/// One logical block of a source file, in source order.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    /// 1-indexed source lines covered by this block.
    pub line_start: usize,
    pub line_end: usize,
    pub symbol: Option<String>,
}

impl Block {
    #[must_use]
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

/// A packed chunk: contiguous blocks plus the overlap prefix carried from
/// the previous chunk.
#[derive(Debug, Clone)]
pub struct PackedChunk {
    pub text: String,
    pub line_start: usize,
    pub line_end: usize,
    /// First symbol name among packed blocks, if any.
    pub symbol: Option<String>,
    pub has_symbols: bool,
}

pub fn pack_blocks(blocks: Vec<Block>, config: &ChunkConfig) -> Vec<PackedChunk> {
    let blocks = split_oversize(blocks, config.hard_cap_tokens);

    let mut chunks: Vec<PackedChunk> = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    let mut current_tokens = 0usize;
    let mut symbol_count = 0usize;

    for block in blocks {
        let block_tokens = block.tokens();
        let is_symbol = block.kind == BlockKind::Symbol;
        let over_budget = !current.is_empty() && current_tokens + block_tokens > config.chunk_tokens;
        let over_symbols =
            is_symbol && symbol_count >= config.max_symbol_blocks_per_chunk && !current.is_empty();

        if over_budget || over_symbols {
            flush(&mut chunks, &mut current, config);
            current_tokens = 0;
            symbol_count = 0;
        }

        current_tokens += block_tokens;
        if is_symbol {
            symbol_count += 1;
        }
        current.push(block);
    }
    flush(&mut chunks, &mut current, config);
    chunks
}

fn flush(chunks: &mut Vec<PackedChunk>, current: &mut Vec<Block>, config: &ChunkConfig) {
    if current.is_empty() {
        return;
    }
    let blocks = std::mem::take(current);
    let body: String = join_blocks(&blocks);
    let line_start = blocks[0].line_start;
    let line_end = blocks.last().map(|b| b.line_end).unwrap_or(line_start);
    let symbol = blocks.iter().find_map(|b| b.symbol.clone());
    let has_symbols = blocks.iter().any(|b| b.kind == BlockKind::Symbol);

    let (text, line_start) = match chunks.last() {
        Some(prev) if config.overlap_tokens > 0 => {
            let overlap_lines = tail_lines_by_tokens(&prev.text, config.overlap_tokens);
            if overlap_lines.is_empty() {
                (body, line_start)
            } else {
                let overlap = overlap_lines.join("\n");
                let adjusted = line_start.saturating_sub(overlap_lines.len()).max(1);
                (format!("{overlap}\n{body}"), adjusted)
            }
        }
        _ => (body, line_start),
    };

    chunks.push(PackedChunk {
        text,
        line_start,
        line_end,
        symbol,
        has_symbols,
    });
}

fn join_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    for (idx, block) in blocks.iter().enumerate() {
        if idx > 0 && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&block.text);
    }
    out
}

/// Line-split any block whose estimate exceeds the hard cap, keeping kind
/// and symbol attribution on every piece.
fn split_oversize(blocks: Vec<Block>, hard_cap: usize) -> Vec<Block> {
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.tokens() <= hard_cap {
            out.push(block);
            continue;
        }

        let lines: Vec<&str> = block.text.lines().collect();
        let mut piece: Vec<&str> = Vec::new();
        let mut piece_tokens = 0usize;
        let mut piece_start = block.line_start;
        let mut line_no = block.line_start;
        for line in lines {
            let line_tokens = estimate_tokens(line);
            if !piece.is_empty() && piece_tokens + line_tokens > hard_cap {
                out.push(Block {
                    kind: block.kind,
                    text: piece.join("\n"),
                    line_start: piece_start,
                    line_end: line_no.saturating_sub(1),
                    symbol: block.symbol.clone(),
                });
                piece.clear();
                piece_tokens = 0;
                piece_start = line_no;
            }
            piece.push(line);
            piece_tokens += line_tokens;
            line_no += 1;
        }
        if !piece.is_empty() {
            out.push(Block {
                kind: block.kind,
                text: piece.join("\n"),
                line_start: piece_start,
                line_end: block.line_end,
                symbol: block.symbol,
            });
        }
    }
    out
}

/// Trailing lines of `text` whose combined estimate stays within `tokens`.
fn tail_lines_by_tokens(text: &str, tokens: usize) -> Vec<String> {
    if tokens == 0 {
        return Vec::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    let mut selected: Vec<String> = Vec::new();
    let mut remaining = tokens;
    for line in lines.iter().rev() {
        let t = estimate_tokens(line);
        if t > remaining && !selected.is_empty() {
            break;
        }
        selected.push((*line).to_string());
        if t >= remaining {
            break;
        }
        remaining -= t;
    }
    selected.reverse();
    selected
}
