use crate::error::{ChunkerError, Result};
use serde::{Deserialize, Serialize};

/// Chunking configuration shared by every strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Target tokens per chunk.
    pub chunk_tokens: usize,

    /// Tokens of trailing context repeated at the head of the next chunk.
    pub overlap_tokens: usize,

    /// Upper bound of symbol blocks packed into one chunk.
    pub max_symbol_blocks_per_chunk: usize,

    /// Hard cap: any block above this is line-split before packing, so no
    /// chunk can exceed the embedder's sequence budget.
    pub hard_cap_tokens: usize,

    /// Emit child chunks for oversized symbol blocks.
    pub hierarchical: bool,

    /// Target tokens per child chunk in hierarchical mode.
    pub micro_budget_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 800,
            overlap_tokens: 120,
            max_symbol_blocks_per_chunk: 8,
            hard_cap_tokens: 992,
            hierarchical: false,
            micro_budget_tokens: 200,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_tokens == 0 {
            return Err(ChunkerError::InvalidConfig(
                "chunk_tokens must be positive".to_string(),
            ));
        }
        if self.hard_cap_tokens < self.chunk_tokens {
            return Err(ChunkerError::InvalidConfig(format!(
                "hard_cap_tokens {} is below chunk_tokens {}",
                self.hard_cap_tokens, self.chunk_tokens
            )));
        }
        if self.overlap_tokens >= self.chunk_tokens {
            return Err(ChunkerError::InvalidConfig(format!(
                "overlap_tokens {} must be below chunk_tokens {}",
                self.overlap_tokens, self.chunk_tokens
            )));
        }
        if self.max_symbol_blocks_per_chunk == 0 {
            return Err(ChunkerError::InvalidConfig(
                "max_symbol_blocks_per_chunk must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rough token estimate used consistently by the budgeter and strategies:
/// ~4 chars per token for code-ish text, floor 1.
#[must_use]
pub fn estimate_tokens(content: &str) -> usize {
    (content.len() / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ChunkConfig::default().validate().unwrap();
    }

    #[test]
    fn overlap_must_stay_below_target() {
        let config = ChunkConfig {
            overlap_tokens: 800,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hard_cap_must_cover_target() {
        let config = ChunkConfig {
            chunk_tokens: 800,
            hard_cap_tokens: 400,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
